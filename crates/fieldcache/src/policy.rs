use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// How an intercepted request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve a cached entry without touching the network; fetch and store on miss.
    CacheFirst,
    /// Serve a cached entry immediately and refresh it in the background.
    /// Falls back to the network (and waits for it) only on a miss.
    #[default]
    StaleWhileRevalidate,
}

impl FetchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchPolicy::CacheFirst => "cache-first",
            FetchPolicy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cache-first" => Ok(FetchPolicy::CacheFirst),
            "stale-while-revalidate" | "swr" => Ok(FetchPolicy::StaleWhileRevalidate),
            other => Err(format!(
                "unknown fetch policy: {other}, use 'cache-first' or 'stale-while-revalidate'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_names() {
        assert_eq!("cache-first".parse::<FetchPolicy>(), Ok(FetchPolicy::CacheFirst));
        assert_eq!(
            " Stale-While-Revalidate ".parse::<FetchPolicy>(),
            Ok(FetchPolicy::StaleWhileRevalidate)
        );
        assert_eq!("swr".parse::<FetchPolicy>(), Ok(FetchPolicy::StaleWhileRevalidate));
        assert!("network-first".parse::<FetchPolicy>().is_err());
    }

    #[test]
    fn defaults_to_stale_while_revalidate() {
        assert_eq!(FetchPolicy::default(), FetchPolicy::StaleWhileRevalidate);
        assert_eq!(FetchPolicy::default().to_string(), "stale-while-revalidate");
    }
}
