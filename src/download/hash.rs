//! 文件摘要计算，用于下载完成后的完整性校验

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// 读取文件时的缓冲区大小
const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashType {
    Md5,
    Crc32,
    Sha1,
    Sha256,
}

/// 对整个文件计算摘要，返回小写十六进制字符串
pub fn calculate_file_hash(path: &Path, hash_type: HashType) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; BUFFER_SIZE];

    match hash_type {
        HashType::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                context.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", context.compute()))
        }
        HashType::Crc32 => {
            let mut hasher = crc32fast::Hasher::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:08x}", hasher.finalize()))
        }
        HashType::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
        HashType::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
    }
}

/// 校验文件摘要是否与期望值一致，十六进制比较忽略大小写
pub fn verify_file_hash(path: &Path, hash_type: HashType, expected: &str) -> std::io::Result<bool> {
    let actual = calculate_file_hash(path, hash_type)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use tempfile::TempDir;
    use super::*;

    fn write_test_file(dir: &TempDir, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("hash_test.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn test_md5() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(&dir, b"hello world");
        let hash = calculate_file_hash(&path, HashType::Md5).unwrap();
        assert_eq!(hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_sha1() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(&dir, b"hello world");
        let hash = calculate_file_hash(&path, HashType::Sha1).unwrap();
        assert_eq!(hash, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn test_sha256() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(&dir, b"hello world");
        let hash = calculate_file_hash(&path, HashType::Sha256).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_crc32() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(&dir, b"hello world");
        let hash = calculate_file_hash(&path, HashType::Crc32).unwrap();
        assert_eq!(hash, "0d4a1185");
    }

    #[test]
    fn verify_should_ignore_case() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(&dir, b"hello world");
        assert!(verify_file_hash(&path, HashType::Md5, "5EB63BBBE01EEED093CB22BB8F5ACDC3").unwrap());
        assert!(!verify_file_hash(&path, HashType::Md5, "00000000000000000000000000000000").unwrap());
    }
}
