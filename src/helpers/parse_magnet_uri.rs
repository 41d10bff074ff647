use data_encoding::BASE32;
use sha1::{Digest, Sha1};

pub struct ParsedMagnet {
    pub hash: String,
    pub name: Option<String>,
}

/// Canonicalises an info-hash to 40 lowercase hex chars. Accepts the usual
/// 40-char hex form as well as the 32-char base32 form some clients emit.
pub fn canonicalise_info_hash(raw: &str) -> Option<String> {
    if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(raw.to_lowercase());
    }

    if raw.len() == 32 {
        let bytes = BASE32.decode(raw.to_uppercase().as_bytes()).ok()?;
        if bytes.len() == 20 {
            return Some(data_encoding::HEXLOWER.encode(&bytes));
        }
    }

    None
}

pub fn parse_magnet_uri(magnet_uri: &str) -> Option<ParsedMagnet> {
    let parts = url::Url::parse(magnet_uri).ok()?;
    let mut hash = None;
    let mut name = None;
    for (key, value) in parts.query_pairs() {
        match key.as_ref() {
            "xt" if value.starts_with("urn:btih:") => {
                hash = canonicalise_info_hash(&value[9..]);
            }
            "dn" => {
                name = Some(value.to_string());
            }
            _ => {}
        }
    }

    let hash = hash?;
    Some(ParsedMagnet { hash, name })
}

/// Rebuilds a magnet URI with every `tr` (tracker) query parameter removed,
/// honouring the `rmTrackerUrls` add-torrent flag.
pub fn strip_trackers(magnet_uri: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(magnet_uri) else { return magnet_uri.to_string() };
    let kept: Vec<(String, String)> = parsed.query_pairs().filter(|(k, _)| k != "tr").map(|(k, v)| (k.into_owned(), v.into_owned())).collect();

    parsed.query_pairs_mut().clear();
    for (key, value) in kept {
        parsed.query_pairs_mut().append_pair(&key, &value);
    }
    parsed.to_string()
}

/// Builds a magnet URI from raw `.torrent` bytes, returning the info-hash and
/// a reconstructed magnet link. Used for the qBittorrent `torrents` multipart
/// field and for the round-trip property tested in `GetMagnetFromBytes`.
pub fn magnet_from_torrent_bytes(bytes: &[u8]) -> anyhow::Result<(String, String)> {
    let magnet_uri = rs_torrent_magnet::magnet_from_torrent(bytes.to_vec())
        .map_err(|e| anyhow::anyhow!("failed to parse .torrent file: {e}"))?;
    let parsed = parse_magnet_uri(&magnet_uri)
        .ok_or_else(|| anyhow::anyhow!("torrent file produced an unparseable magnet"))?;
    Ok((parsed.hash, magnet_uri))
}

/// Best-effort info-hash of raw bytes, used when nothing else is available.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    data_encoding::HEXLOWER.encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_magnet_uri() {
        let magnet = "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678&dn=example_file";
        let parsed = parse_magnet_uri(magnet).unwrap();
        assert_eq!(parsed.hash, "1234567890abcdef1234567890abcdef12345678");
        assert_eq!(parsed.name, Some("example_file".to_string()));
    }

    #[test]
    fn test_parse_magnet_uri_without_name() {
        let magnet = "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678";
        let parsed = parse_magnet_uri(magnet).unwrap();
        assert_eq!(parsed.hash, "1234567890abcdef1234567890abcdef12345678");
        assert!(parsed.name.is_none());
    }

    #[test]
    fn test_parse_invalid_magnet_uri() {
        let magnet = "invalid_magnet_uri";
        assert!(parse_magnet_uri(magnet).is_none());
    }

    #[test]
    fn test_base32_info_hash_canonicalisation() {
        let hash = canonicalise_info_hash("RCQVO73VO2IJODFEHJL76EARVYQCERFY").unwrap();
        assert_eq!(hash, "8a19577fb5f690970ca43a57ff1011ae202244b8");
    }

    #[test]
    fn test_strip_trackers_removes_all_tr_params() {
        let magnet = "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678&dn=example&tr=udp%3A%2F%2Fa&tr=udp%3A%2F%2Fb";
        let stripped = strip_trackers(magnet);
        let parsed = url::Url::parse(&stripped).unwrap();
        assert_eq!(parsed.query_pairs().filter(|(k, _)| k == "tr").count(), 0);
        let reparsed = parse_magnet_uri(&stripped).unwrap();
        assert_eq!(reparsed.hash, "1234567890abcdef1234567890abcdef12345678");
    }
}
