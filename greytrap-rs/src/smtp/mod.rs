//! The SMTP connection engine: accept loop, per-connection state machine,
//! stuttered output and blacklist rejection replies.

pub mod reply;
pub mod server;
pub mod session;

pub use server::{ServerShared, SmtpServer};
pub use session::Session;

/// Input buffer and maximum command line size.
pub const CON_BUF_SIZE: usize = 8192;
/// Default connection ceiling.
pub const CON_DEFAULT_MAX: usize = 800;
/// Seconds of stutter cancelled for greylisted peers after this long.
pub const CON_GREY_STUTTER: u64 = 10;
/// Default seconds between stuttered bytes.
pub const CON_STUTTER: u64 = 1;
/// Headroom under max_cons at which stuttering is abandoned to free fds.
pub const CON_CLIENT_TOLERANCE: usize = 5;
/// Default SMTP code for blacklist rejection messages.
pub const CON_ERROR_CODE: &str = "450";
/// Unrecognised commands tolerated in the data phase.
pub const CON_MAX_BAD_CMD: u32 = 20;
/// Hard cap in seconds on any single read or write.
pub const MAX_TIME: u64 = 400;
/// Body lines consumed before replying.
pub const CON_MAX_DATA_LINES: u32 = 10;
/// Blacklist-summary cap for connection logs.
pub const CON_BL_SUMMARY_SIZE: usize = 80;
pub const CON_BL_SUMMARY_ETC: &str = " ...";
/// Milliseconds to wait for the firewall's reverse-NAT answer.
pub const DNAT_LOOKUP_TIMEOUT: u64 = 1000;

/// SMTP state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SmtpState {
    BannerIn,
    BannerOut,
    HeloIn,
    HeloOut,
    MailIn,
    MailOut,
    RcptIn,
    RcptOut,
    DataIn,
    DataOut,
    Message,
    Reply,
    Close,
}

/// A blacklist this connection's source address matched: just the name and
/// rejection message, detached from the shared index.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedList {
    pub name: String,
    pub message: String,
}

/// Space-separated blacklist names, truncated with `...` when over the
/// summary budget.
pub fn summarize_lists(lists: &[MatchedList]) -> Option<String> {
    if lists.is_empty() {
        return None;
    }

    let mut out = String::new();
    let budget = CON_BL_SUMMARY_SIZE - CON_BL_SUMMARY_ETC.len();
    for list in lists {
        if out.len() + list.name.len() + 1 >= budget {
            out.push_str(CON_BL_SUMMARY_ETC);
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&list.name);
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(name: &str) -> MatchedList {
        MatchedList {
            name: name.to_string(),
            message: "m".to_string(),
        }
    }

    #[test]
    fn test_summarize_none() {
        assert_eq!(summarize_lists(&[]), None);
    }

    #[test]
    fn test_summarize_joins_names() {
        let lists = [list("spews"), list("nixspam")];
        assert_eq!(summarize_lists(&lists), Some("spews nixspam".to_string()));
    }

    #[test]
    fn test_summarize_truncates() {
        let lists: Vec<MatchedList> = (0..20)
            .map(|i| list(&format!("verylonglistname{i}")))
            .collect();
        let summary = summarize_lists(&lists).unwrap();
        assert!(summary.ends_with(CON_BL_SUMMARY_ETC));
        assert!(summary.len() <= CON_BL_SUMMARY_SIZE + CON_BL_SUMMARY_ETC.len());
    }
}
