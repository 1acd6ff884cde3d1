//! Rotating, mutually-consistent request headers (spec.md §4.5 step 4).

use rand::seq::SliceRandom;

struct BrowserProfile {
    user_agent: &'static str,
    accept_language: &'static str,
    sec_ch_ua: &'static str,
}

const PROFILES: &[BrowserProfile] = &[
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        sec_ch_ua: "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
    },
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        accept_language: "en-US,en;q=0.9",
        sec_ch_ua: "\"Safari\";v=\"17\", \"Not-A.Brand\";v=\"99\"",
    },
    BrowserProfile {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        accept_language: "en-US,en;q=0.5",
        sec_ch_ua: "\"Firefox\";v=\"125\", \"Not-A.Brand\";v=\"99\"",
    },
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        accept_language: "en-GB,en;q=0.9",
        sec_ch_ua: "\"Chromium\";v=\"124\", \"Microsoft Edge\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
    },
];

/// One coherent, realistic set of request headers. `accept_language` and
/// `sec_ch_ua` always come from the same browser family as `user_agent` —
/// spec.md §4.5 requires headers that are "mutually consistent".
pub struct HeaderSet {
    pub user_agent: &'static str,
    pub accept_language: &'static str,
    pub sec_ch_ua: &'static str,
}

pub fn random_header_set() -> HeaderSet {
    let profile = PROFILES.choose(&mut rand::thread_rng()).expect("PROFILES is non-empty");
    HeaderSet {
        user_agent: profile.user_agent,
        accept_language: profile.accept_language,
        sec_ch_ua: profile.sec_ch_ua,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_set_is_internally_consistent() {
        for _ in 0..20 {
            let h = random_header_set();
            let matched = PROFILES
                .iter()
                .any(|p| p.user_agent == h.user_agent && p.accept_language == h.accept_language);
            assert!(matched, "header set must come from one declared profile");
        }
    }
}
