//! Rejection reply construction.
//!
//! Blacklist messages are configured with `%A` (source address) and `\n`
//! substitutions; the assembled reply carries the SMTP code on every line
//! with `-` continuation markers on all but the last.

use super::MatchedList;

/// The fixed reply every greylisted (non-blacklisted) connection gets.
pub const TEMPFAIL_REPLY: &str = "451 Temporary failure, please try again later.\r\n";

/// Expand a blacklist message: `%A` becomes the source address, `\n` a
/// newline; `%%` and `\\` escape themselves.
pub fn expand_message(fmt: &str, src_addr: &str) -> String {
    let mut out = String::new();
    let mut saved: Option<char> = None;

    for c in fmt.chars() {
        match c {
            '\\' | '%' => {
                if let Some(s) = saved.take() {
                    out.push(s);
                } else {
                    saved = Some(c);
                }
            }
            'n' if saved == Some('\\') => {
                out.push('\n');
                saved = None;
            }
            'A' if saved == Some('%') => {
                out.push_str(src_addr);
                saved = None;
            }
            _ => {
                if let Some(s) = saved.take() {
                    out.push(s);
                }
                out.push(c);
            }
        }
    }

    out
}

/// Build the final reply for a closing connection. Blacklisted peers get
/// every matched list's expanded message; anyone else gets the fixed
/// temporary-failure line. Lines end in bare `\n`; the writer inserts the
/// `\r`.
pub fn build_reply(lists: &[MatchedList], error_code: &str, src_addr: &str) -> String {
    if lists.is_empty() {
        return TEMPFAIL_REPLY.to_string();
    }

    let mut text = String::new();
    for list in lists {
        text.push_str(&expand_message(&list.message, src_addr));
        if !text.ends_with('\n') {
            text.push('\n');
        }
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let cont = if i + 1 < lines.len() { '-' } else { ' ' };
        out.push_str(error_code);
        out.push(cont);
        out.push_str(line);
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(message: &str) -> MatchedList {
        MatchedList {
            name: "bl".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_expand_address() {
        assert_eq!(
            expand_message("your %A is banned", "192.0.2.10"),
            "your 192.0.2.10 is banned"
        );
    }

    #[test]
    fn test_expand_newline_and_escapes() {
        assert_eq!(expand_message("a\\nb", "x"), "a\nb");
        assert_eq!(expand_message("100%% pure", "x"), "100% pure");
        assert_eq!(expand_message("c:\\\\dir", "x"), "c:\\dir");
    }

    #[test]
    fn test_expand_plain_text_untouched() {
        assert_eq!(expand_message("no substitutions", "x"), "no substitutions");
    }

    #[test]
    fn test_build_reply_multi_line_continuation() {
        let lists = [matched("your %A is banned\\nsee http://x/")];
        let reply = build_reply(&lists, "450", "192.0.2.10");

        assert_eq!(
            reply,
            "450-your 192.0.2.10 is banned\n450 see http://x/\n"
        );
    }

    #[test]
    fn test_build_reply_single_line() {
        let lists = [matched("go away")];
        assert_eq!(build_reply(&lists, "550", "x"), "550 go away\n");
    }

    #[test]
    fn test_build_reply_multiple_lists() {
        let lists = [matched("first"), matched("second")];
        assert_eq!(
            build_reply(&lists, "450", "x"),
            "450-first\n450 second\n"
        );
    }

    #[test]
    fn test_build_reply_unlisted_gets_tempfail() {
        assert_eq!(build_reply(&[], "450", "x"), TEMPFAIL_REPLY);
    }
}
