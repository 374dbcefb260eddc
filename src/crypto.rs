/// 工作连接的流变换
///
/// 代理配置声明 `use_encryption` / `use_compression` 时，在数据拷贝前
/// 对工作连接加一层逐帧变换：明文切块后先压缩（zlib）再加密
/// （AES-256-GCM，密钥为认证密钥的 SHA-256，随机 nonce 随帧携带），
/// 以 4 字节大端长度前缀成帧。变换通过一对泵任务桥接到内存 duplex，
/// 调用方拿到的仍然是一个普通的双向流。
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::msg::WorkConn;

/// 流加密密钥
pub type StreamKey = [u8; 32];

/// 明文切块大小
const PLAIN_CHUNK_SIZE: usize = 8 * 1024;

/// 单帧密文上限，超出视为流损坏
const MAX_FRAME_SIZE: usize = 64 * 1024;

const NONCE_SIZE: usize = 12;

/// 从认证密钥派生流加密密钥
pub fn derive_key(token: &str) -> StreamKey {
    let digest = Sha256::digest(token.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// 按代理配置包装工作连接
///
/// 两个方向各由一个泵任务驱动；任一侧出错或到达 EOF 时泵退出，
/// 对应的半边随之关闭，错误以连接中断的形式暴露给拷贝方。
pub fn wrap_work_conn(
    conn: WorkConn,
    key: &StreamKey,
    use_encryption: bool,
    use_compression: bool,
) -> WorkConn {
    if !use_encryption && !use_compression {
        return conn;
    }

    let cipher = use_encryption.then(|| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));
    let (local, remote) = tokio::io::duplex(4 * PLAIN_CHUNK_SIZE);

    let (mut conn_rd, mut conn_wr) = tokio::io::split(conn);
    let (mut plain_rd, mut plain_wr) = tokio::io::split(remote);

    let seal_cipher = cipher.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; PLAIN_CHUNK_SIZE];
        loop {
            let n = match plain_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let frame = match seal_frame(&buf[..n], use_compression, seal_cipher.as_ref()) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("failed to seal stream frame: {}", e);
                    break;
                }
            };
            let len_bytes = (frame.len() as u32).to_be_bytes();
            if conn_wr.write_all(&len_bytes).await.is_err()
                || conn_wr.write_all(&frame).await.is_err()
                || conn_wr.flush().await.is_err()
            {
                break;
            }
        }
        let _ = conn_wr.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 4];
            if conn_rd.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME_SIZE {
                debug!("invalid stream frame length: {}", len);
                break;
            }
            let mut frame = vec![0u8; len];
            if conn_rd.read_exact(&mut frame).await.is_err() {
                break;
            }
            let plain = match open_frame(&frame, use_compression, cipher.as_ref()) {
                Ok(plain) => plain,
                Err(e) => {
                    debug!("failed to open stream frame: {}", e);
                    break;
                }
            };
            if plain_wr.write_all(&plain).await.is_err() {
                break;
            }
        }
        let _ = plain_wr.shutdown().await;
    });

    Box::new(local)
}

fn seal_frame(data: &[u8], compress: bool, cipher: Option<&Aes256Gcm>) -> Result<Vec<u8>> {
    let payload = if compress {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| TunnelError::codec(e.to_string()))?
    } else {
        data.to_vec()
    };

    match cipher {
        Some(cipher) => {
            let mut nonce = [0u8; NONCE_SIZE];
            rand::thread_rng().fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), payload.as_ref())
                .map_err(|_| TunnelError::codec("encryption failed"))?;
            let mut frame = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
            frame.extend_from_slice(&nonce);
            frame.extend_from_slice(&ciphertext);
            Ok(frame)
        }
        None => Ok(payload),
    }
}

fn open_frame(frame: &[u8], compressed: bool, cipher: Option<&Aes256Gcm>) -> Result<Vec<u8>> {
    let payload = match cipher {
        Some(cipher) => {
            if frame.len() <= NONCE_SIZE {
                return Err(TunnelError::codec("frame shorter than nonce"));
            }
            let (nonce, ciphertext) = frame.split_at(NONCE_SIZE);
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| TunnelError::codec("decryption failed"))?
        }
        None => frame.to_vec(),
    };

    if compressed {
        let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
        decoder
            .write_all(&payload)
            .and_then(|_| decoder.finish())
            .map_err(|e| TunnelError::codec(e.to_string()))
    } else {
        Ok(payload)
    }
}
