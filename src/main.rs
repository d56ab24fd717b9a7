use std::io::{self, Write};

use bitcoin::Amount;
use bitcoin::Network as BitcoinNetwork;
use bitcoin::consensus::encode;
use bitcoin::secp256k1::{All, Secp256k1};
use clap::Parser;

mod broadcast;
mod cli;
mod client;
mod error;
mod fee;
mod transaction;
mod types;
mod wallet;

use broadcast::BroadcastChannel;
use cli::{CliArgs, parse_network, validate_fee_rate};
use error::AppError;
use types::Utxo;

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。");

    let network = parse_network(&args.network)?;
    log::info!("指定されたネットワーク: {:?}", network);
    validate_fee_rate(args.fee_rate)?;

    let secp: Secp256k1<All> = Secp256k1::new();

    // 鍵ペアはここで一度だけ確定し、以降は不変の値としてパイプラインに渡す
    let wallet_path = wallet::resolve_wallet_path(&args.wallet_file);
    let (key_pair, generated) = wallet::load_or_generate(&wallet_path, network, &secp)?;
    if generated {
        println!("新しいウォレットを生成しました: {}", wallet_path.display());
        println!("注意: このファイルには秘密鍵が含まれます。安全に保管してください。");
    } else {
        println!("既存のウォレットを読み込みました: {}", wallet_path.display());
    }
    let address = key_pair.address.to_string();
    println!("アドレス ({:?}): {}", network, address);

    let rpc_url = broadcast::resolve_rpc_url(&args, network)?;

    if args.history {
        return show_history(network, &address);
    }

    let utxo_channel = broadcast::select_utxo_channel(rpc_url.as_deref(), args.rpc_only)?;
    log::info!("UTXOを取得します...");
    let utxos = broadcast::fetch_utxos(&utxo_channel, network, &address)?;
    display_utxos(&utxos);

    if utxos.is_empty() {
        println!("\n資金がありません。");
        if network == BitcoinNetwork::Testnet {
            println!("テストネットのfaucetからコインを入手できます:");
            println!("  - https://testnet-faucet.mempool.co/");
            println!("  - https://coinfaucet.eu/en/btc-testnet/");
            println!("送付先アドレス: {}", address);
        }
        return Ok(());
    }

    if args.check_balance {
        let total: u64 = utxos.iter().map(|u| u.value).sum();
        println!(
            "\n合計残高: {} sats ({:.8} BTC)",
            total,
            total as f64 / 100_000_000.0
        );
        return Ok(());
    }

    let Some(data_text) = &args.data else {
        println!("\n--data でOP_RETURNデータを指定するか、--check-balance で残高を確認してください。");
        return Ok(());
    };
    let data = data_text.as_bytes();
    println!("\nOP_RETURNデータ: \"{}\"", data_text);
    println!("  バイト列: {}", hex::encode(data));
    println!("  長さ: {} bytes", data.len());

    let selected = select_utxo(&utxos, args.utxo_index)?;
    println!(
        "\n使用するUTXO: {}:{} ({} sats)",
        selected.txid, selected.vout, selected.value
    );

    log::info!("トランザクション構築処理を開始します。");
    let (unsigned, quote) = transaction::build_transaction(
        selected,
        data,
        &key_pair,
        args.fee_rate,
        args.allow_large_opreturn,
    )?;
    log::debug!("手数料見積もり: {:?}", quote);

    log::info!("トランザクション署名処理を開始します。");
    let signed = transaction::sign_transaction(
        unsigned,
        Amount::from_sat(selected.value),
        &key_pair,
        &secp,
    )?;
    log::info!("署名済みトランザクションの生成に成功しました。");

    // ブロードキャストが拒否されても手動で再送できるよう、hexは先に表示しておく
    let tx_hex = encode::serialize_hex(&signed);
    println!("\nRaw transaction hex:\n{}", tx_hex);

    let channel = broadcast::select_broadcast_channel(rpc_url.as_deref(), args.broadcast);
    if channel == BroadcastChannel::PublicApi
        && network == BitcoinNetwork::Bitcoin
        && !confirm_mainnet_broadcast()?
    {
        println!("ブロードキャストを中止しました。");
        return Ok(());
    }

    match broadcast::dispatch(&channel, network, &tx_hex)? {
        Some(txid) => {
            println!("\nブロードキャスト成功!");
            println!("  TXID: {}", txid);
            println!("  {}", client::explorer_tx_url(network, &txid));
        }
        None => {
            println!("\nブロードキャスト方法:");
            println!("  - --broadcast を付けて mempool.space へ送信");
            println!("  - --rpc-user/--rpc-password を指定してローカルのBitcoin Coreへ送信");
            println!(
                "  - または {} にhexを貼り付けて手動送信",
                client::manual_push_url(network)
            );
        }
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}

fn display_utxos(utxos: &[Utxo]) {
    if utxos.is_empty() {
        println!("\nこのアドレスのUTXOは見つかりませんでした。");
        return;
    }
    println!("\n利用可能なUTXO ({}件):", utxos.len());
    for (i, utxo) in utxos.iter().enumerate() {
        println!("[{}] {}:{}", i, utxo.txid, utxo.vout);
        println!(
            "    金額: {} sats ({:.8} BTC)",
            utxo.value,
            utxo.value as f64 / 100_000_000.0
        );
        println!(
            "    状態: {}",
            if utxo.status.confirmed {
                "確認済み"
            } else {
                "未確認"
            }
        );
    }
}

fn select_utxo(utxos: &[Utxo], index: Option<usize>) -> Result<&Utxo, AppError> {
    match index {
        Some(i) => utxos.get(i).ok_or_else(|| {
            AppError::InputValidation(format!(
                "無効なUTXOインデックスです: {} (指定可能範囲: 0-{})",
                i,
                utxos.len() - 1
            ))
        }),
        // 省略時は先頭のUTXOを使う
        None => Ok(&utxos[0]),
    }
}

fn show_history(network: BitcoinNetwork, address: &str) -> Result<(), AppError> {
    log::info!("取引履歴を取得します...");
    let records = client::MempoolClient::new(network)?.fetch_op_return_history(address)?;

    if records.is_empty() {
        println!("\nこのアドレスのOP_RETURNトランザクションはありません。");
        return Ok(());
    }

    println!("\nOP_RETURNトランザクション ({}件):", records.len());
    for (i, record) in records.iter().enumerate() {
        println!("\n[{}] TXID: {}", i + 1, record.txid);
        match (record.confirmed, record.block_height) {
            (true, Some(height)) => println!("    状態: 確認済み (ブロック {})", height),
            (true, None) => println!("    状態: 確認済み"),
            _ => println!("    状態: 未確認"),
        }
        println!(
            "    手数料: {} sats, サイズ: {} bytes",
            record.fee, record.size
        );
        match std::str::from_utf8(&record.payload) {
            Ok(text) => println!("    データ: \"{}\"", text),
            Err(_) => println!("    データ (hex): {}", hex::encode(&record.payload)),
        }
        println!("    データ長: {} bytes", record.payload.len());
        println!("    {}", client::explorer_tx_url(network, &record.txid));
    }
    Ok(())
}

fn confirm_mainnet_broadcast() -> Result<bool, AppError> {
    println!("警告: MAINNET (本物のBitcoin) へブロードキャストしようとしています!");
    print!("続行するには 'yes' と入力してください: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().eq_ignore_ascii_case("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConfirmationStatus;

    fn utxo(value: u64) -> Utxo {
        Utxo {
            txid: "22".repeat(32),
            vout: 0,
            value,
            status: ConfirmationStatus::default(),
        }
    }

    #[test]
    fn utxo_selection_defaults_to_first() {
        let utxos = vec![utxo(1000), utxo(2000)];
        assert_eq!(select_utxo(&utxos, None).unwrap().value, 1000);
        assert_eq!(select_utxo(&utxos, Some(1)).unwrap().value, 2000);
    }

    #[test]
    fn out_of_range_utxo_index_is_input_error() {
        let utxos = vec![utxo(1000)];
        assert!(matches!(
            select_utxo(&utxos, Some(1)),
            Err(AppError::InputValidation(_))
        ));
    }
}
