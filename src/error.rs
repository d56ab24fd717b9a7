use bitcoin::key::FromWifError as BitcoinKeyError; // WIFデコードエラー用
use bitcoin::secp256k1::Error as SecpError;
use bitcoin::sighash::P2wpkhError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("OP_RETURNデータが大きすぎます: {length} bytes (標準ポリシー上限 {limit} bytes)。--allow-large-opreturn で上書き可能")]
    PayloadTooLarge { length: usize, limit: usize },

    #[error("資金不足: UTXOの金額 {available} sats では手数料 {fee} sats を賄えません (不足 {shortfall} sats)")]
    InsufficientFunds {
        available: u64,
        fee: u64,
        shortfall: u64,
    },

    #[error("鍵マテリアルエラー: {0}")]
    KeyMaterial(String),

    #[error("Bitcoin秘密鍵(WIF)処理エラー: {0}")]
    BitcoinKey(#[from] BitcoinKeyError),

    #[error("ネットワーク不整合: CLI指定 ({cli_network}) vs ウォレットファイル ({inferred_network})")]
    NetworkMismatch {
        cli_network: String,
        inferred_network: String,
    },

    #[error("secp256k1エラー: {0}")]
    Secp256k1(#[from] SecpError),

    #[error("Sighash計算エラー (入力インデックス {input_index}): {source}")]
    Sighash {
        input_index: usize,
        #[source]
        source: P2wpkhError,
    },

    #[error("APIリクエスト失敗 ({url}): {source}")]
    Api {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("RPCエラー ({method}): {detail}")]
    Rpc { method: String, detail: String },

    #[error("ブロードキャスト拒否: {reason}")]
    Rejection { reason: String },

    #[error("内部エラー: {0}")]
    Internal(String),
}
