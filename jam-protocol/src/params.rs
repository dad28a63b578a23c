//! Param-list grammar: comma-separated `key=value` pairs terminated by `;`
//!
//! Only the file-streaming handshake uses this format.

use std::fmt;

/// Ordered `key=value` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamList {
    pairs: Vec<(String, String)>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a param-list
    ///
    /// Parsing stops at the first `;`. An unterminated trailing pair is still
    /// taken as the final parameter. Pairs without `=` are skipped.
    pub fn parse(raw: &str) -> Self {
        let body = match raw.find(';') {
            Some(end) => &raw[..end],
            None => raw,
        };

        let pairs = body
            .split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect();

        Self { pairs }
    }

    /// Append a parameter
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Single-parameter `error=<message>;` reply
    pub fn error(message: impl fmt::Display) -> Self {
        // Separators inside the message would break the grammar
        let message = message.to_string().replace([',', ';', '='], " ");
        Self::new().with("error", message)
    }
}

impl fmt::Display for ParamList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        f.write_str(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload_handshake() {
        let params = ParamList::parse("action=upload,fileId=abc_123,fileType=wav,length=2048;");
        assert_eq!(params.get("action"), Some("upload"));
        assert_eq!(params.get("fileId"), Some("abc_123"));
        assert_eq!(params.get("fileType"), Some("wav"));
        assert_eq!(params.get("length"), Some("2048"));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_parse_stops_at_first_terminator() {
        let params = ParamList::parse("action=download,fileId=x;junk=1,more=2");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("junk"), None);
    }

    #[test]
    fn test_parse_unterminated_trailing_pair() {
        let params = ParamList::parse("action=download,fileId=abc");
        assert_eq!(params.get("fileId"), Some("abc"));
    }

    #[test]
    fn test_parse_skips_malformed_pairs() {
        let params = ParamList::parse("action=upload,oops,fileId=a;");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("action"), Some("upload"));
        assert_eq!(params.get("fileId"), Some("a"));
    }

    #[test]
    fn test_parse_empty() {
        assert!(ParamList::parse("").is_empty());
        assert!(ParamList::parse(";").is_empty());
    }

    #[test]
    fn test_display() {
        let params = ParamList::new().with("action", "download").with("fileId", "s1");
        assert_eq!(params.to_string(), "action=download,fileId=s1;");
    }

    #[test]
    fn test_error_reply_escapes_separators() {
        let reply = ParamList::error("bad=value; really, bad");
        assert_eq!(reply.to_string(), "error=bad value  really  bad;");
        assert_eq!(ParamList::parse(&reply.to_string()).get("error"), Some("bad value  really  bad"));
    }
}
