use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bitcoin::secp256k1::{All, Secp256k1, SecretKey, rand};
use bitcoin::{Address, CompressedPublicKey, Network as BitcoinNetwork, PrivateKey};

use crate::error::AppError;

/// 環境変数によるウォレットパスの上書き (CLIフラグより優先)
pub const WALLET_ENV_VAR: &str = "BITCOIN_OPS_WALLET";

/// 署名鍵ペアと対応するP2WPKHアドレス。
/// 導出は秘密鍵とネットワークの純粋な決定的関数で、生成後は不変。
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: CompressedPublicKey,
    pub address: Address,
}

impl KeyPair {
    pub fn derive(
        private_key: PrivateKey,
        network: BitcoinNetwork,
        secp: &Secp256k1<All>,
    ) -> Result<Self, AppError> {
        let public_key = CompressedPublicKey::from_private_key(secp, &private_key)
            .map_err(|e| AppError::KeyMaterial(format!("圧縮公開鍵の導出に失敗: {}", e)))?;
        let address = Address::p2wpkh(&public_key, network);
        Ok(KeyPair {
            private_key,
            public_key,
            address,
        })
    }

    /// 暗号論的に安全な乱数から新しい鍵ペアを生成する。
    pub fn generate(network: BitcoinNetwork, secp: &Secp256k1<All>) -> Result<Self, AppError> {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::derive(PrivateKey::new(secret_key, network), network, secp)
    }
}

/// ウォレットファイルパスの解決: 環境変数 → ~ 展開 → 絶対パス化。
/// ファイルシステムへのアクセスより前に行う。
pub fn resolve_wallet_path(cli_path: &Path) -> PathBuf {
    let raw = match std::env::var(WALLET_ENV_VAR) {
        Ok(v) if !v.is_empty() => {
            log::debug!("環境変数 {} によりウォレットパスを上書き: {}", WALLET_ENV_VAR, v);
            PathBuf::from(v)
        }
        _ => cli_path.to_path_buf(),
    };
    let expanded = expand_tilde(&raw);
    std::path::absolute(&expanded).unwrap_or(expanded)
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// 既存の鍵を読み込むか、なければ生成して保存する。
/// 戻り値のboolは新規生成したかどうか。
pub fn load_or_generate(
    path: &Path,
    network: BitcoinNetwork,
    secp: &Secp256k1<All>,
) -> Result<(KeyPair, bool), AppError> {
    if path.exists() {
        log::info!("既存のウォレットを読み込みます: {:?}", path);
        Ok((load(path, network, secp)?, false))
    } else {
        log::info!("新しいウォレットを生成します: {:?}", path);
        let key_pair = KeyPair::generate(network, secp)?;
        save(path, &key_pair.private_key)?;
        log::info!("秘密鍵を保存しました: {:?}", path);
        Ok((key_pair, true))
    }
}

pub fn load(
    path: &Path,
    network: BitcoinNetwork,
    secp: &Secp256k1<All>,
) -> Result<KeyPair, AppError> {
    let content = fs::read_to_string(path).map_err(|e| {
        log::error!("ウォレットファイルの読み込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    let wif = content.trim();
    if wif.is_empty() {
        return Err(AppError::KeyMaterial(format!(
            "ウォレットファイルが空です: {}",
            path.display()
        )));
    }
    let private_key = PrivateKey::from_wif(wif)?;
    if private_key.network != network.into() {
        return Err(AppError::NetworkMismatch {
            cli_network: format!("{:?}", network),
            inferred_network: format!("{:?}", private_key.network),
        });
    }
    KeyPair::derive(private_key, network, secp)
}

/// 秘密鍵をWIF形式で保存する。親ディレクトリは0700、ファイルは0600で作成し、
/// 既存の鍵ファイルは決して上書きしない (create_new による排他的作成)。
pub fn save(path: &Path, private_key: &PrivateKey) -> Result<(), AppError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            create_private_dir(dir)?;
            log::info!("ウォレットディレクトリを作成しました: {:?}", dir);
        }
    }
    let mut file = open_private_file(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            AppError::KeyMaterial(format!(
                "鍵ファイルが既に存在するため上書きしません: {}",
                path.display()
            ))
        } else {
            AppError::Io(e)
        }
    })?;
    file.write_all(private_key.to_wif().as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_private_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}
