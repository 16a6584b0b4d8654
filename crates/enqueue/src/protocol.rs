//! The hook wire format (§6): u64-length-prefixed integers, strings, and
//! string sets read off the driver's input stream.

use tokio::io::{AsyncRead, AsyncReadExt};

pub struct Setting {
    pub key: String,
    #[allow(dead_code)]
    pub val: String,
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let len = read_u64(r).await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub async fn read_string_set<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<String>> {
    let count = read_u64(r).await? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_string(r).await?);
    }
    Ok(out)
}

/// `repeated while keylen != 0 : u64 keylen, bytes key, u64 vallen, bytes val`.
/// Collected but not otherwise consulted by the core (§4.4 step 1).
pub async fn read_settings<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<Setting>> {
    let mut settings = Vec::new();
    loop {
        let key_len = read_u64(r).await?;
        if key_len == 0 {
            break;
        }
        let mut key_buf = vec![0u8; key_len as usize];
        r.read_exact(&mut key_buf).await?;
        let key = String::from_utf8_lossy(&key_buf).into_owned();
        let val = read_string(r).await?;
        settings.push(Setting { key, val });
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_string(s: &str) -> Vec<u8> {
        let mut buf = (s.len() as u64).to_le_bytes().to_vec();
        buf.extend_from_slice(s.as_bytes());
        buf
    }

    #[tokio::test]
    async fn reads_a_length_prefixed_string() {
        let bytes = framed_string("try");
        let mut cursor = std::io::Cursor::new(bytes);
        let s = read_string(&mut cursor).await.unwrap();
        assert_eq!(s, "try");
    }

    #[tokio::test]
    async fn reads_a_string_set() {
        let mut bytes = 2u64.to_le_bytes().to_vec();
        bytes.extend(framed_string("a"));
        bytes.extend(framed_string("bb"));
        let mut cursor = std::io::Cursor::new(bytes);
        let set = read_string_set(&mut cursor).await.unwrap();
        assert_eq!(set, vec!["a".to_string(), "bb".to_string()]);
    }

    #[tokio::test]
    async fn stops_reading_settings_at_a_zero_length_key() {
        let mut bytes = Vec::new();
        bytes.extend(3u64.to_le_bytes());
        bytes.extend(b"foo");
        bytes.extend(framed_string("bar"));
        bytes.extend(0u64.to_le_bytes());

        let mut cursor = std::io::Cursor::new(bytes);
        let settings = read_settings(&mut cursor).await.unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].key, "foo");
        assert_eq!(settings[0].val, "bar");
    }
}
