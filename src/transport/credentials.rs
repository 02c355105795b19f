//! 认证凭据：密钥对（黑盒）与 JWT 形态识别

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// 密钥对；签名算法由外部提供
pub trait KeyPair: Send + Sync {
    /// 公钥的文本形式
    fn public_key(&self) -> String;

    /// 对服务器下发的 nonce 签名
    fn sign(&self, nonce: &[u8]) -> Vec<u8>;

    /// 校验签名（服务端用）
    fn verify(&self, nonce: &[u8], signature: &[u8]) -> bool;

    /// 导出私钥（序列化）
    fn export_private(&self) -> String;
}

/// 是否为可解析的 JWT：三段 base64url，头与声明都是 JSON 对象
pub fn is_jwt(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return false;
    }
    parts[..2].iter().all(|segment| {
        let trimmed = segment.trim_end_matches('=');
        URL_SAFE_NO_PAD
            .decode(trimmed)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .map(|v| v.is_object())
            .unwrap_or(false)
    })
}
