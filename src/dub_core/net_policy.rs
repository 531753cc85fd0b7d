use crate::dub_core::settings::AppSettings;

/// Model-hub hosts that may be allow-listed independently of general egress.
const MODEL_HOSTS: &[&str] = &["huggingface.co", "hf.co", "cdn-lfs.huggingface.co"];

/// Outbound-connection policy gate. There is no socket patching in this
/// design: every HTTP client in the service consults the policy before
/// dialing, so the kill-switch is enforced at the only places that dial.
#[derive(Debug, Clone)]
pub struct EgressPolicy {
    allow_egress: bool,
    allow_hf_egress: bool,
    offline_mode: bool,
}

impl EgressPolicy {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            allow_egress: settings.allow_egress,
            allow_hf_egress: settings.allow_hf_egress,
            offline_mode: settings.offline_mode,
        }
    }

    fn is_local(host: &str) -> bool {
        host == "localhost"
            || host == "::1"
            || host.starts_with("127.")
            || host == "0.0.0.0"
    }

    fn is_model_host(host: &str) -> bool {
        MODEL_HOSTS
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }

    /// Whether dialing `host` is permitted under the current policy.
    pub fn allow_host(&self, host: &str) -> bool {
        if Self::is_local(host) {
            return true;
        }
        if self.offline_mode {
            return false;
        }
        if self.allow_egress {
            return true;
        }
        self.allow_hf_egress && Self::is_model_host(host)
    }

    /// Convenience for URL-bearing call sites.
    pub fn allow_url(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self.allow_host(&host),
            None => false,
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    // Strip a port, but not the colons of a bracketed IPv6 literal.
    let host = if let Some(stripped) = host.strip_prefix('[') {
        stripped.split(']').next().unwrap_or(stripped)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow_egress: bool, allow_hf: bool, offline: bool) -> EgressPolicy {
        EgressPolicy {
            allow_egress,
            allow_hf_egress: allow_hf,
            offline_mode: offline,
        }
    }

    #[test]
    fn localhost_is_always_allowed() {
        let locked_down = policy(false, false, true);
        assert!(locked_down.allow_host("localhost"));
        assert!(locked_down.allow_host("127.0.0.1"));
        assert!(locked_down.allow_url("http://127.0.0.1:8787/metrics"));
    }

    #[test]
    fn egress_denied_by_default_and_opened_by_flag() {
        let default = policy(false, false, false);
        assert!(!default.allow_host("ntfy.sh"));
        assert!(!default.allow_host("huggingface.co"));

        let open = policy(true, false, false);
        assert!(open.allow_host("ntfy.sh"));
    }

    #[test]
    fn model_hosts_pass_only_under_hf_flag() {
        let hf_only = policy(false, true, false);
        assert!(hf_only.allow_host("huggingface.co"));
        assert!(hf_only.allow_host("cdn-lfs.huggingface.co"));
        assert!(!hf_only.allow_host("example.com"));
        assert!(!hf_only.allow_host("evil-huggingface.co"));
    }

    #[test]
    fn offline_mode_beats_every_allow_flag() {
        let offline = policy(true, true, true);
        assert!(!offline.allow_host("huggingface.co"));
        assert!(!offline.allow_host("ntfy.sh"));
        assert!(offline.allow_host("localhost"));
    }

    #[test]
    fn host_extraction_handles_ports_and_paths() {
        assert_eq!(host_of("https://ntfy.sh/topic"), Some("ntfy.sh".to_string()));
        assert_eq!(
            host_of("http://user@example.com:8080/x?y"),
            Some("example.com".to_string())
        );
        assert_eq!(host_of("http://[::1]:9000/z"), Some("::1".to_string()));
        assert_eq!(host_of("not a url"), Some("not a url".to_string()));
    }
}
