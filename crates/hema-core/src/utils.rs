//! 通用工具函数

use sha2::{Digest, Sha256};

/// 计算十六进制 SHA-256 摘要
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// 校验和格式：64 位小写十六进制
pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum.len() == 64 && checksum.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// 对原始模型输出做数值稳定的 softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_valid_checksum(&sha256_hex(b"abc")));
    }

    #[test]
    fn test_is_valid_checksum() {
        assert!(!is_valid_checksum(""));
        assert!(!is_valid_checksum("../../etc/passwd"));
        assert!(!is_valid_checksum(&"A".repeat(64)));
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[2.0, 1.0, 0.1]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[0] > probs[1] && probs[1] > probs[2]);
    }
}
