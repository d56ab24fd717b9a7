use crate::types::FeeQuote;

// 固定サイズモデルの定数。実際のシリアライズ結果の測定ではなく文書化された近似値
// (DERエンコードによる署名長の±1バイトの揺らぎはモデル化しない)。
// 互換性のある手数料見積もりを維持するため定数のまま保持する。

/// バージョン + 入出力カウント + locktime
pub const BASE_OVERHEAD_VSIZE: u64 = 10;
/// P2WPKH segwit入力1つぶん
pub const P2WPKH_INPUT_VSIZE: u64 = 68;
/// データ出力のオーバーヘッド (8バイトのvalue + スクリプト長プレフィックス + pushオペコード)
pub const DATA_OUTPUT_OVERHEAD_VSIZE: u64 = 10;
/// おつり出力 (8バイトのvalue + P2WPKHスクリプト)
pub const CHANGE_OUTPUT_VSIZE: u64 = 31;

/// トランザクション形状 (1入力、データ出力、おつり出力の有無) と手数料率から
/// 仮想サイズと絶対手数料を見積もる。純粋関数。
/// 手数料は最も近い整数satに切り上げる。
pub fn estimate(has_change: bool, data_len: usize, fee_rate: f64) -> FeeQuote {
    let mut vsize = BASE_OVERHEAD_VSIZE
        + P2WPKH_INPUT_VSIZE
        + DATA_OUTPUT_OVERHEAD_VSIZE
        + data_len as u64;
    if has_change {
        vsize += CHANGE_OUTPUT_VSIZE;
    }
    let fee = (vsize as f64 * fee_rate).ceil() as u64;
    FeeQuote {
        vsize,
        rate: fee_rate,
        fee,
    }
}
