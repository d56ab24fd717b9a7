use serde::Deserialize;

/// mempool.space (Esplora互換) の /address/{addr}/utxo が返すUTXO。
/// scantxoutset の結果も同じ形に正規化する。
#[derive(Deserialize, Debug, Clone)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64, // sats
    #[serde(default)]
    pub status: ConfirmationStatus,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ConfirmationStatus {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// 固定サイズモデルによる手数料見積もりの結果。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeQuote {
    /// 推定仮想サイズ (vbytes)
    pub vsize: u64,
    /// 手数料率 (sats/vB、小数可)
    pub rate: f64,
    /// 絶対手数料 (sats、切り上げ)
    pub fee: u64,
}

/// /address/{addr}/txs のトランザクション要素 (必要なフィールドのみ)。
#[derive(Deserialize, Debug)]
pub struct AddressTx {
    pub txid: String,
    #[serde(default)]
    pub vout: Vec<TxOutEntry>,
    #[serde(default)]
    pub status: ConfirmationStatus,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize, Debug)]
pub struct TxOutEntry {
    #[serde(default)]
    pub scriptpubkey: String,
    #[serde(default)]
    pub scriptpubkey_type: String,
}

/// OP_RETURN履歴の1件。ペイロードはデコード済みバイト列。
#[derive(Debug)]
pub struct OpReturnRecord {
    pub txid: String,
    pub payload: Vec<u8>,
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub fee: u64,
    pub size: u64,
}
