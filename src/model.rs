use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a newsgroup accepts postings, from the LIST active flag
/// ([RFC 3977 §7.6.3](https://datatracker.ietf.org/doc/html/rfc3977#section-7.6.3)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingStatus {
    Permitted,
    Moderated,
    NotPermitted,
}

impl PostingStatus {
    pub(crate) fn from_flag(flag: &str) -> Self {
        match flag {
            "y" => PostingStatus::Permitted,
            "m" => PostingStatus::Moderated,
            _ => PostingStatus::NotPermitted,
        }
    }
}

/// A newsgroup as reported by LIST or GROUP.
///
/// LIST lines carry no article count, so `count` is zero there; GROUP
/// responses carry no posting flag, so `posting` defaults to
/// [`PostingStatus::NotPermitted`] there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub low: u64,
    pub high: u64,
    pub count: u64,
    pub posting: PostingStatus,
}

/// Parsed NNTP status line.
///
/// Response codes are defined in [RFC 3977 §3.2](https://datatracker.ietf.org/doc/html/rfc3977#section-3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NntpResponse {
    pub code: u16,
    pub message: String,
}

/// Expected status code for a command's response.
///
/// `Exact(215)` accepts only 215. `Century(2)` accepts 200–299 and
/// `Decade(21)` accepts 210–219, computed by integer division rather than
/// string prefixes so that e.g. `Century(1)` matches 100–199 and nothing
/// else. `Any` disables the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Exact(u16),
    Century(u16),
    Decade(u16),
}

impl Expect {
    pub fn matches(self, code: u16) -> bool {
        match self {
            Expect::Any => true,
            Expect::Exact(want) => code == want,
            Expect::Century(century) => code / 100 == century,
            Expect::Decade(decade) => code / 10 == decade,
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Any => write!(f, "any"),
            Expect::Exact(code) => write!(f, "{code}"),
            Expect::Century(century) => write!(f, "{century}xx"),
            Expect::Decade(decade) => write!(f, "{decade}x"),
        }
    }
}

/// How LIST treats lines it cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedLinePolicy {
    /// Drop unparseable lines and return the rest.
    #[default]
    Skip,
    /// Abort the whole listing on the first unparseable line.
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_accepts_only_exact_match() {
        assert!(Expect::Exact(215).matches(215));
        assert!(!Expect::Exact(215).matches(214));
        assert!(!Expect::Exact(215).matches(216));
        assert!(!Expect::Exact(215).matches(515));
    }

    #[test]
    fn century_accepts_whole_range() {
        for code in 200..=299 {
            assert!(Expect::Century(2).matches(code), "{code}");
        }
        assert!(!Expect::Century(2).matches(199));
        assert!(!Expect::Century(2).matches(300));
    }

    #[test]
    fn century_one_matches_only_1xx() {
        assert!(Expect::Century(1).matches(100));
        assert!(Expect::Century(1).matches(199));
        assert!(!Expect::Century(1).matches(99));
        assert!(!Expect::Century(1).matches(200));
    }

    #[test]
    fn decade_accepts_ten_codes() {
        for code in 210..=219 {
            assert!(Expect::Decade(21).matches(code), "{code}");
        }
        assert!(!Expect::Decade(21).matches(209));
        assert!(!Expect::Decade(21).matches(220));
    }

    #[test]
    fn any_accepts_everything() {
        assert!(Expect::Any.matches(100));
        assert!(Expect::Any.matches(599));
    }

    #[test]
    fn posting_flag_parsing() {
        assert_eq!(PostingStatus::from_flag("y"), PostingStatus::Permitted);
        assert_eq!(PostingStatus::from_flag("m"), PostingStatus::Moderated);
        assert_eq!(PostingStatus::from_flag("n"), PostingStatus::NotPermitted);
        assert_eq!(PostingStatus::from_flag("x"), PostingStatus::NotPermitted);
    }

    #[test]
    fn expect_display() {
        assert_eq!(Expect::Exact(281).to_string(), "281");
        assert_eq!(Expect::Century(2).to_string(), "2xx");
        assert_eq!(Expect::Decade(21).to_string(), "21x");
        assert_eq!(Expect::Any.to_string(), "any");
    }
}
