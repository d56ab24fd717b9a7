use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    absolute::LockTime,
    opcodes,
    script::{Builder, Instruction, PushBytesBuf},
    secp256k1::{All, Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
};
use std::str::FromStr;

use crate::{error::AppError, fee, types::FeeQuote, types::Utxo, wallet::KeyPair};

// Bitcoin Coreのデフォルトダスト閾値 (P2WPKH出力に対して)
const DUST_THRESHOLD_SATS: u64 = 546;

// Bitcoin Coreのデフォルト -datacarriersize。超える場合は明示的な上書きが必要
const MAX_STANDARD_DATA_LEN: usize = 80;

// 上書きフラグがあっても受け付けない絶対上限
const MAX_DATA_LEN: usize = 10_000;

/// OP_RETURNスクリプトを構築する。pushオペコードの選択
/// (直接push / OP_PUSHDATA1 / OP_PUSHDATA2) はビルダーの最小push規則に従う。
pub fn build_op_return_script(data: &[u8]) -> Result<ScriptBuf, AppError> {
    let push_bytes = PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| AppError::InputValidation(format!("pushできないデータ長です: {} bytes", data.len())))?;
    Ok(Builder::new()
        .push_opcode(opcodes::all::OP_RETURN)
        .push_slice(push_bytes)
        .into_script())
}

/// OP_RETURNスクリプトからペイロードを取り出す (build_op_return_scriptの逆操作)。
/// OP_RETURN以外、またはpushが続かないスクリプトはNone。
pub fn decode_op_return_payload(script: &bitcoin::Script) -> Option<Vec<u8>> {
    if !script.is_op_return() {
        return None;
    }
    let mut instructions = script.instructions();
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == opcodes::all::OP_RETURN => {}
        _ => return None,
    }
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => Some(bytes.as_bytes().to_vec()),
        _ => None,
    }
}

/// 選択したUTXOとペイロードから未署名トランザクションを組み立てる。
///
/// 出力順序は固定: データ出力 (value 0) が先、おつりが後。
/// この順序はtxidの再現性のためそのまま維持すること。
pub fn build_transaction(
    utxo: &Utxo,
    data: &[u8],
    key_pair: &KeyPair,
    fee_rate: f64,
    allow_large: bool,
) -> Result<(Transaction, FeeQuote), AppError> {
    // ペイロードポリシーは手数料計算より前に検証する
    if data.len() > MAX_DATA_LEN {
        return Err(AppError::InputValidation(format!(
            "OP_RETURNデータが大きすぎます: {} bytes (絶対上限 {} bytes)",
            data.len(),
            MAX_DATA_LEN
        )));
    }
    if data.len() > MAX_STANDARD_DATA_LEN && !allow_large {
        return Err(AppError::PayloadTooLarge {
            length: data.len(),
            limit: MAX_STANDARD_DATA_LEN,
        });
    }

    let txid = Txid::from_str(&utxo.txid)
        .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", utxo.txid, e)))?;
    let input = TxIn {
        previous_output: OutPoint::new(txid, utxo.vout),
        script_sig: ScriptBuf::new(), // 署名前は空
        sequence: Sequence::MAX,
        witness: Witness::new(), // 署名前は空
    };

    let data_output = TxOut {
        value: Amount::ZERO,
        script_pubkey: build_op_return_script(data)?,
    };

    // まずおつり出力ありと仮定して暫定手数料を見積もる
    let with_change = fee::estimate(true, data.len(), fee_rate);
    let change_value = utxo.value.saturating_sub(with_change.fee);

    let (outputs, quote) = if change_value >= DUST_THRESHOLD_SATS {
        log::debug!(
            "おつり発生: {} sats (手数料 {} sats, vsize {} vB)",
            change_value,
            with_change.fee,
            with_change.vsize
        );
        let change_output = TxOut {
            value: Amount::from_sat(change_value),
            script_pubkey: key_pair.address.script_pubkey(),
        };
        (vec![data_output, change_output], with_change)
    } else {
        // ダストポリシー: おつり出力を落とし、おつりなしで手数料を再計算。
        // 余りはすべて手数料に吸収される
        let no_change = fee::estimate(false, data.len(), fee_rate);
        if utxo.value < no_change.fee {
            return Err(AppError::InsufficientFunds {
                available: utxo.value,
                fee: no_change.fee,
                shortfall: no_change.fee - utxo.value,
            });
        }
        log::warn!(
            "おつり候補 {} sats はダスト閾値 {} sats 未満のため出力しません。実質手数料は {} sats になります。",
            change_value,
            DUST_THRESHOLD_SATS,
            utxo.value
        );
        (vec![data_output], no_change)
    };

    let transaction = Transaction {
        version: bitcoin::transaction::Version(2),
        lock_time: LockTime::ZERO,
        input: vec![input],
        output: outputs,
    };
    log::debug!(
        "未署名トランザクション構築完了: 入力 {} sats, 出力数 {}, 見積もり手数料 {} sats",
        utxo.value,
        transaction.output.len(),
        quote.fee
    );
    Ok((transaction, quote))
}

/// BIP-143方式のP2WPKH sighash (SIGHASH_ALL) を計算し、RFC 6979の決定的ECDSAで署名、
/// witnessスタック [DER署名+sighashタイプ, 圧縮公開鍵] を入力に設定する。
pub fn sign_transaction(
    mut transaction: Transaction,
    utxo_value: Amount,
    key_pair: &KeyPair,
    secp: &Secp256k1<All>,
) -> Result<Transaction, AppError> {
    let script_pubkey = key_pair.address.script_pubkey();
    let script_code = script_pubkey
        .p2wpkh_script_code()
        .ok_or_else(|| AppError::Internal("P2WPKH script codeの取得に失敗".to_string()))?;
    let sighash_type = EcdsaSighashType::All;

    let sighash = {
        // SighashCache のスコープ内でのみ transaction を可変借用する
        let mut sighash_cache = SighashCache::new(&mut transaction);
        sighash_cache
            .p2wpkh_signature_hash(0, &script_code, utxo_value, sighash_type)
            .map_err(|e| AppError::Sighash {
                input_index: 0,
                source: e,
            })?
    };
    let message = Message::from_digest_slice(sighash.as_ref())?;

    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, &key_pair.private_key.inner),
        sighash_type,
    };

    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    witness.push(key_pair.public_key.to_bytes());
    transaction.input[0].witness = witness;

    log::debug!("入力 0 (P2WPKH) の署名適用完了。");
    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network as BitcoinNetwork;
    use bitcoin::PrivateKey;
    use bitcoin::consensus::encode;
    use bitcoin::secp256k1::SecretKey;
    use crate::types::ConfirmationStatus;

    fn test_key(secp: &Secp256k1<All>) -> KeyPair {
        let secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        KeyPair::derive(
            PrivateKey::new(secret, BitcoinNetwork::Testnet),
            BitcoinNetwork::Testnet,
            secp,
        )
        .unwrap()
    }

    fn test_utxo(value: u64) -> Utxo {
        Utxo {
            txid: "11".repeat(32),
            vout: 0,
            value,
            status: ConfirmationStatus::default(),
        }
    }

    #[test]
    fn payload_at_limit_is_accepted() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let result = build_transaction(&test_utxo(100_000), &[0xab; 80], &key, 2.0, false);
        assert!(result.is_ok());
    }

    #[test]
    fn payload_over_limit_fails_before_fee_computation() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        // UTXOの金額が0でも手数料計算に入る前にPayloadTooLargeになる
        let result = build_transaction(&test_utxo(0), &[0xab; 81], &key, 2.0, false);
        assert!(matches!(
            result,
            Err(AppError::PayloadTooLarge {
                length: 81,
                limit: 80
            })
        ));
    }

    #[test]
    fn override_flag_allows_large_payload() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let (tx, _) =
            build_transaction(&test_utxo(100_000), &[0xab; 81], &key, 2.0, true).unwrap();
        assert_eq!(decode_op_return_payload(&tx.output[0].script_pubkey).unwrap(), vec![0xab; 81]);
    }

    #[test]
    fn hard_cap_applies_even_with_override() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let result = build_transaction(&test_utxo(10_000_000), &[0u8; 10_001], &key, 2.0, true);
        assert!(matches!(result, Err(AppError::InputValidation(_))));
    }

    #[test]
    fn two_output_scenario() {
        // 100,000 sats, 2 sat/vB, 14バイトのデータ → vsize 133, 手数料 266, おつり 99,734
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let data = b"Hello Bitcoin!";
        let (tx, quote) = build_transaction(&test_utxo(100_000), data, &key, 2.0, false).unwrap();

        assert_eq!(quote.vsize, 133);
        assert_eq!(quote.fee, 266);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value, Amount::ZERO);
        assert!(tx.output[0].script_pubkey.is_op_return());
        assert_eq!(tx.output[1].value, Amount::from_sat(99_734));
        assert_eq!(tx.output[1].script_pubkey, key.address.script_pubkey());

        // 入力金額 = 出力合計 + 手数料 が厳密に成り立つ
        let output_sum: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(output_sum + quote.fee, 100_000);
    }

    #[test]
    fn dust_change_is_dropped() {
        // 600 sats, 2 sat/vB, 10バイト → おつりなし vsize 98, 手数料 196, 余り 404 < 546
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let (tx, quote) =
            build_transaction(&test_utxo(600), &[0x42; 10], &key, 2.0, false).unwrap();

        assert_eq!(tx.output.len(), 1);
        assert!(tx.output[0].script_pubkey.is_op_return());
        assert_eq!(quote.vsize, 98);
        assert_eq!(quote.fee, 196);
        // 落としたおつり候補はダスト閾値未満だったはず
        assert!(600 - fee::estimate(true, 10, 2.0).fee < DUST_THRESHOLD_SATS);
    }

    #[test]
    fn insufficient_funds_names_shortfall() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let result = build_transaction(&test_utxo(150), &[0x42; 10], &key, 2.0, false);
        assert!(matches!(
            result,
            Err(AppError::InsufficientFunds {
                available: 150,
                fee: 196,
                shortfall: 46
            })
        ));
    }

    #[test]
    fn input_structure_and_placeholders() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let utxo = test_utxo(100_000);
        let (tx, _) = build_transaction(&utxo, b"data", &key, 2.0, false).unwrap();

        assert_eq!(tx.version, bitcoin::transaction::Version(2));
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.txid, Txid::from_str(&utxo.txid).unwrap());
        assert_eq!(tx.input[0].previous_output.vout, 0);
        assert!(tx.input[0].script_sig.is_empty());
        assert!(tx.input[0].witness.is_empty());
    }

    #[test]
    fn op_return_script_uses_minimal_push_opcodes() {
        // 75バイト以下: 直接push
        let script = build_op_return_script(&[0xcc; 14]).unwrap();
        let bytes = script.as_bytes();
        assert_eq!(bytes[0], 0x6a);
        assert_eq!(bytes[1], 14);

        // 76-255バイト: OP_PUSHDATA1
        let script = build_op_return_script(&[0xcc; 81]).unwrap();
        let bytes = script.as_bytes();
        assert_eq!(bytes[0], 0x6a);
        assert_eq!(bytes[1], 0x4c);
        assert_eq!(bytes[2], 81);

        // 256バイト以上: OP_PUSHDATA2 (リトルエンディアン長)
        let script = build_op_return_script(&[0xcc; 300]).unwrap();
        let bytes = script.as_bytes();
        assert_eq!(bytes[0], 0x6a);
        assert_eq!(bytes[1], 0x4d);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 300);
    }

    #[test]
    fn op_return_payload_roundtrip() {
        for len in [1usize, 75, 76, 80, 255, 256] {
            let data = vec![0x5a; len];
            let script = build_op_return_script(&data).unwrap();
            assert_eq!(decode_op_return_payload(&script).unwrap(), data);
        }
        // OP_RETURN以外のスクリプトはNone
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        assert!(decode_op_return_payload(&key.address.script_pubkey()).is_none());
    }

    #[test]
    fn signed_transaction_witness_structure() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let utxo = test_utxo(100_000);
        let (tx, _) = build_transaction(&utxo, b"Hello Bitcoin!", &key, 2.0, false).unwrap();
        let signed =
            sign_transaction(tx, Amount::from_sat(utxo.value), &key, &secp).unwrap();

        let witness = &signed.input[0].witness;
        assert_eq!(witness.len(), 2);
        let signature = witness.nth(0).unwrap();
        let pubkey = witness.nth(1).unwrap();
        // DER署名の末尾にSIGHASH_ALLバイトが付く
        assert_eq!(*signature.last().unwrap(), 0x01);
        assert_eq!(pubkey, key.public_key.to_bytes().as_slice());
        // script_sigはsegwitでは空のまま
        assert!(signed.input[0].script_sig.is_empty());
    }

    #[test]
    fn serialization_roundtrip_preserves_bytes_and_txid() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let utxo = test_utxo(100_000);
        let (tx, _) = build_transaction(&utxo, b"roundtrip", &key, 2.0, false).unwrap();
        let signed =
            sign_transaction(tx, Amount::from_sat(utxo.value), &key, &secp).unwrap();

        let bytes = encode::serialize(&signed);
        let reparsed: Transaction = encode::deserialize(&bytes).unwrap();
        assert_eq!(encode::serialize(&reparsed), bytes);
        assert_eq!(reparsed.compute_txid(), signed.compute_txid());
    }

    #[test]
    fn signing_is_deterministic() {
        let secp = Secp256k1::new();
        let key = test_key(&secp);
        let utxo = test_utxo(100_000);

        let (tx1, _) = build_transaction(&utxo, b"deterministic", &key, 2.0, false).unwrap();
        let (tx2, _) = build_transaction(&utxo, b"deterministic", &key, 2.0, false).unwrap();
        let signed1 =
            sign_transaction(tx1, Amount::from_sat(utxo.value), &key, &secp).unwrap();
        let signed2 =
            sign_transaction(tx2, Amount::from_sat(utxo.value), &key, &secp).unwrap();

        assert_eq!(encode::serialize(&signed1), encode::serialize(&signed2));
    }
}
