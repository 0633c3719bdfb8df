//! Command-line codec: flat argv tokens to a key/value map.
//!
//! A flag is a token starting with `-` or `--`. A Windows-style `/name`
//! switch is accepted too, as long as it holds no further `/` (so absolute
//! paths stay values). The key is the token with leading `-`/`/` stripped.
//! The following token becomes the flag's value unless it is itself a flag.

use std::collections::HashMap;

/// Key whose presence marks a process as a worker.
pub const ARGS_KEY: &str = "args";

/// Decoded command-line options. Repeated flags keep the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgMap {
    entries: HashMap<String, String>,
}

impl ArgMap {
    /// Decode tokens left to right. Tokens that are neither flags nor
    /// consumed as a flag's value are ignored.
    pub fn decode<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<S> = tokens.into_iter().collect();
        let mut entries = HashMap::new();

        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i].as_ref();
            if is_flag(token) {
                let key = flag_key(token).to_string();
                match tokens.get(i + 1).map(|next| next.as_ref()) {
                    Some(next) if !is_flag(next) => {
                        entries.insert(key, next.to_string());
                        i += 1;
                    }
                    _ => {
                        entries.insert(key, String::new());
                    }
                }
            }
            i += 1;
        }

        Self { entries }
    }

    /// Decode this process's own arguments (argv[0] excluded).
    pub fn from_env() -> Self {
        Self::decode(
            std::env::args_os()
                .skip(1)
                .map(|arg| arg.to_string_lossy().into_owned()),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_worker_mode(&self) -> bool {
        self.contains(ARGS_KEY)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Re-encode as `--key value` tokens (value omitted when empty).
    ///
    /// Values that would themselves parse as flags do not survive a round trip.
    pub fn to_tokens(&self) -> Vec<String> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        let mut tokens = Vec::with_capacity(self.entries.len() * 2);
        for key in keys {
            tokens.push(format!("--{key}"));
            let value = &self.entries[key];
            if !value.is_empty() {
                tokens.push(value.clone());
            }
        }
        tokens
    }
}

/// True when the current process was launched as a worker.
pub fn is_worker_mode() -> bool {
    ArgMap::from_env().is_worker_mode()
}

/// A token is a flag if it starts with `-`, or is a `/name` switch.
///
/// A leading `/` only counts when no further `/` follows, so absolute paths
/// such as `/tmp/out.json` stay values. This is narrower than treating every
/// leading slash as a switch.
pub fn is_flag(token: &str) -> bool {
    if token.starts_with('-') {
        return true;
    }
    match token.strip_prefix('/') {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}

fn flag_key(token: &str) -> &str {
    token.trim_start_matches(['-', '/'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_takes_following_value() {
        let map = ArgMap::decode(["--op", "uppercase", "-n", "3"]);
        assert_eq!(map.get("op"), Some("uppercase"));
        assert_eq!(map.get("n"), Some("3"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn flag_followed_by_flag_has_empty_value() {
        let map = ArgMap::decode(["--verbose", "--op", "x", "--last"]);
        assert_eq!(map.get("verbose"), Some(""));
        assert_eq!(map.get("op"), Some("x"));
        assert_eq!(map.get("last"), Some(""));
    }

    #[test]
    fn stray_tokens_are_ignored() {
        let map = ArgMap::decode(["stray", "--op", "x", "another", "more"]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("op"), Some("x"));
    }

    #[test]
    fn slash_switch_is_a_flag_but_paths_are_values() {
        let map = ArgMap::decode(["/args", "payload", "--out", "/tmp/result.json"]);
        assert_eq!(map.get("args"), Some("payload"));
        assert_eq!(map.get("out"), Some("/tmp/result.json"));
    }

    #[test]
    fn absolute_paths_are_never_flags() {
        assert!(is_flag("/verbose"));
        assert!(!is_flag("/tmp/x"));
        assert!(!is_flag("/"));

        let map = ArgMap::decode(["--in", "/tmp/x", "/dry"]);
        assert_eq!(map.get("in"), Some("/tmp/x"));
        assert_eq!(map.get("dry"), Some(""));
        assert!(!map.contains("tmp/x"));
    }

    #[test]
    fn removed_key_is_not_re_encoded() {
        let mut map = ArgMap::decode(["--args", "p", "--op", "x"]);
        assert_eq!(map.remove("args").as_deref(), Some("p"));
        assert!(!map.is_worker_mode());
        assert_eq!(map.to_tokens(), ["--op", "x"]);
    }

    #[test]
    fn repeated_flag_keeps_last_value() {
        let map = ArgMap::decode(["--op", "a", "--op", "b"]);
        assert_eq!(map.get("op"), Some("b"));
    }

    #[test]
    fn worker_mode_requires_args_key() {
        assert!(ArgMap::decode(["--x", "1", "--args", "{}"]).is_worker_mode());
        assert!(ArgMap::decode(["-args"]).is_worker_mode());
        assert!(!ArgMap::decode(["--arguments", "{}"]).is_worker_mode());
        assert!(!ArgMap::decode(["args"]).is_worker_mode());
    }

    #[test]
    fn quoted_payload_token_is_a_value() {
        let token = r#""{\"operation_type\":\"demo\"}""#;
        let map = ArgMap::decode(["--args", token, "--op", "uppercase"]);
        assert_eq!(map.get("args"), Some(token));
        assert_eq!(map.get("op"), Some("uppercase"));
    }

    #[test]
    fn reencoded_tokens_decode_to_same_values() {
        let original = ArgMap::decode(["--op", "uppercase", "--flag", "-c", "4", "/x", "y"]);
        let reparsed = ArgMap::decode(original.to_tokens());
        assert_eq!(original, reparsed);
        assert_eq!(
            ArgMap::decode(reparsed.to_tokens()).get("c"),
            Some("4"),
        );
    }
}
