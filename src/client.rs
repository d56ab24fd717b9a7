use std::time::Duration;

use bitcoin::{Amount, Network as BitcoinNetwork};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::AppError;
use crate::transaction;
use crate::types::{AddressTx, ConfirmationStatus, OpReturnRecord, Utxo};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
// scantxoutset はUTXOセット全体を走査するため大きめに取る
const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

pub fn api_base(network: BitcoinNetwork) -> &'static str {
    match network {
        BitcoinNetwork::Bitcoin => "https://mempool.space/api",
        _ => "https://mempool.space/testnet/api",
    }
}

pub fn explorer_tx_url(network: BitcoinNetwork, txid: &str) -> String {
    match network {
        BitcoinNetwork::Bitcoin => format!("https://mempool.space/tx/{}", txid),
        _ => format!("https://mempool.space/testnet/tx/{}", txid),
    }
}

/// 手動でraw hexを貼り付けられるページ
pub fn manual_push_url(network: BitcoinNetwork) -> &'static str {
    match network {
        BitcoinNetwork::Bitcoin => "https://mempool.space/tx/push",
        _ => "https://mempool.space/testnet/tx/push",
    }
}

/// mempool.space (Esplora互換API) クライアント。
pub struct MempoolClient {
    api_base: String,
    client: reqwest::blocking::Client,
}

impl MempoolClient {
    pub fn new(network: BitcoinNetwork) -> Result<Self, AppError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("HTTPクライアントの初期化に失敗: {}", e)))?;
        Ok(MempoolClient {
            api_base: api_base(network).to_string(),
            client,
        })
    }

    pub fn fetch_utxos(&self, address: &str) -> Result<Vec<Utxo>, AppError> {
        let url = format!("{}/address/{}/utxo", self.api_base, address);
        log::debug!("UTXOを取得します: {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::Api {
                url: url.clone(),
                source: e,
            })?;
        response.json::<Vec<Utxo>>().map_err(|e| AppError::Api { url, source: e })
    }

    /// raw hexをPOSTしてブロードキャストする。成功時はtxidのテキストが返る。
    pub fn broadcast(&self, tx_hex: &str) -> Result<String, AppError> {
        let url = format!("{}/tx", self.api_base);
        log::debug!("ブロードキャストします: {}", url);
        let response = self
            .client
            .post(&url)
            .body(tx_hex.to_string())
            .send()
            .map_err(|e| AppError::Api {
                url: url.clone(),
                source: e,
            })?;
        let status = response.status();
        let body = response.text().map_err(|e| AppError::Api { url, source: e })?;
        if !status.is_success() {
            // 拒否理由はリモートのレスポンス本文をそのまま伝える
            return Err(AppError::Rejection {
                reason: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }
        Ok(body.trim().to_string())
    }

    /// アドレスの取引一覧からOP_RETURN出力を持つものを抽出し、ペイロードをデコードする。
    pub fn fetch_op_return_history(&self, address: &str) -> Result<Vec<OpReturnRecord>, AppError> {
        let url = format!("{}/address/{}/txs", self.api_base, address);
        log::debug!("取引履歴を取得します: {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::Api {
                url: url.clone(),
                source: e,
            })?;
        let txs: Vec<AddressTx> = response.json().map_err(|e| AppError::Api { url, source: e })?;

        let mut records = Vec::new();
        for tx in txs {
            // 1トランザクションにつき最初のOP_RETURN出力のみ対象にする
            let Some(entry) = tx
                .vout
                .iter()
                .find(|v| v.scriptpubkey_type == "op_return")
            else {
                continue;
            };
            let script_bytes = match hex::decode(&entry.scriptpubkey) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("scriptpubkeyのデコードに失敗 (txid={}): {}", tx.txid, e);
                    continue;
                }
            };
            let payload =
                transaction::decode_op_return_payload(bitcoin::Script::from_bytes(&script_bytes))
                    .unwrap_or_default();
            records.push(OpReturnRecord {
                txid: tx.txid,
                payload,
                confirmed: tx.status.confirmed,
                block_height: tx.status.block_height,
                fee: tx.fee,
                size: tx.size,
            });
        }
        Ok(records)
    }
}

/// Bitcoin Core JSON-RPCクライアント。
pub struct RpcClient {
    url: String,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ScanResult {
    #[serde(default)]
    unspents: Vec<ScanUnspent>,
}

#[derive(Deserialize)]
struct ScanUnspent {
    txid: String,
    vout: u32,
    /// BTC単位 (scantxoutsetはsatではなくBTCで返す)
    amount: f64,
    #[serde(default)]
    height: Option<u64>,
}

impl RpcClient {
    pub fn new(url: String) -> Result<Self, AppError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| AppError::Internal(format!("HTTPクライアントの初期化に失敗: {}", e)))?;
        Ok(RpcClient { url, client })
    }

    /// JSON-RPC 1.0 呼び出し。トランスポート層・HTTP層の失敗のみをエラーにし、
    /// レスポンス中のerrorメンバーの扱いは呼び出し側に委ねる。
    fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<RpcResponse, AppError> {
        let payload = json!({
            "jsonrpc": "1.0",
            "id": "bitcoin-opreturn-cli",
            "method": method,
            "params": params,
        });
        log::debug!("RPC呼び出し: {}", method);
        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .map_err(|e| AppError::Rpc {
                method: method.to_string(),
                detail: format!("接続に失敗しました: {}", e),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AppError::Rpc {
                method: method.to_string(),
                detail: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }
        response.json().map_err(|e| AppError::Rpc {
            method: method.to_string(),
            detail: format!("レスポンスのパースに失敗: {}", e),
        })
    }

    fn call_result(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, AppError> {
        let response = self.call(method, params, timeout)?;
        if let Some(error) = response.error.filter(|e| !e.is_null()) {
            return Err(AppError::Rpc {
                method: method.to_string(),
                detail: error.to_string(),
            });
        }
        response.result.ok_or_else(|| AppError::Rpc {
            method: method.to_string(),
            detail: "レスポンスにresultがありません".to_string(),
        })
    }

    /// scantxoutset によるUTXOセット走査 (txindex不要、ただし遅い)。
    pub fn scan_utxos(&self, address: &str) -> Result<Vec<Utxo>, AppError> {
        log::info!("scantxoutset でUTXOセットを走査します (30-60秒かかることがあります)...");
        let descriptor = format!("addr({})", address);
        let result = self.call_result("scantxoutset", json!(["start", [descriptor]]), SCAN_TIMEOUT)?;
        let scan: ScanResult = serde_json::from_value(result).map_err(|e| AppError::Rpc {
            method: "scantxoutset".to_string(),
            detail: format!("結果のパースに失敗: {}", e),
        })?;
        convert_unspents(scan)
    }

    /// sendrawtransaction。RPCのerrorメンバーはブロードキャスト拒否として扱う。
    pub fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, AppError> {
        let response = self.call("sendrawtransaction", json!([tx_hex]), HTTP_TIMEOUT)?;
        if let Some(error) = response.error.filter(|e| !e.is_null()) {
            return Err(AppError::Rejection {
                reason: error.to_string(),
            });
        }
        match response.result {
            Some(Value::String(txid)) => Ok(txid),
            other => Err(AppError::Rpc {
                method: "sendrawtransaction".to_string(),
                detail: format!("予期しないresult: {:?}", other),
            }),
        }
    }
}

fn convert_unspents(scan: ScanResult) -> Result<Vec<Utxo>, AppError> {
    let mut utxos = Vec::with_capacity(scan.unspents.len());
    for unspent in scan.unspents {
        let value = Amount::from_btc(unspent.amount)
            .map_err(|e| AppError::Rpc {
                method: "scantxoutset".to_string(),
                detail: format!("金額の変換に失敗 ({}): {}", unspent.amount, e),
            })?
            .to_sat();
        utxos.push(Utxo {
            txid: unspent.txid,
            vout: unspent.vout,
            value,
            // scantxoutset は確認済みUTXOのみを返す
            status: ConfirmationStatus {
                confirmed: true,
                block_height: unspent.height,
            },
        });
    }
    Ok(utxos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_per_network() {
        assert_eq!(api_base(BitcoinNetwork::Bitcoin), "https://mempool.space/api");
        assert_eq!(
            api_base(BitcoinNetwork::Testnet),
            "https://mempool.space/testnet/api"
        );
    }

    #[test]
    fn explorer_urls() {
        assert_eq!(
            explorer_tx_url(BitcoinNetwork::Testnet, "abc"),
            "https://mempool.space/testnet/tx/abc"
        );
        assert_eq!(
            explorer_tx_url(BitcoinNetwork::Bitcoin, "abc"),
            "https://mempool.space/tx/abc"
        );
    }

    #[test]
    fn scantxoutset_amounts_convert_to_sats() {
        let scan: ScanResult = serde_json::from_value(json!({
            "success": true,
            "unspents": [
                {
                    "txid": "63611617ee33c761c2c9586d0f998baa16bfd876b703921a6a1b31c2933abf64",
                    "vout": 1,
                    "scriptPubKey": "0014b255f786aa697139fdcd7bd82eabfb0b74ee11ef",
                    "amount": 0.00099734,
                    "height": 2868i64
                }
            ],
            "total_amount": 0.00099734
        }))
        .unwrap();

        let utxos = convert_unspents(scan).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].value, 99_734);
        assert_eq!(utxos[0].vout, 1);
        assert!(utxos[0].status.confirmed);
        assert_eq!(utxos[0].status.block_height, Some(2868));
    }

    #[test]
    fn rpc_error_member_is_detected() {
        let response: RpcResponse = serde_json::from_value(json!({
            "result": null,
            "error": {"code": -26, "message": "min relay fee not met"},
            "id": "bitcoin-opreturn-cli"
        }))
        .unwrap();
        let error = response.error.filter(|e| !e.is_null()).unwrap();
        assert!(error.to_string().contains("min relay fee"));
    }
}
