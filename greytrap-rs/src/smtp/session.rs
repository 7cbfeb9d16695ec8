//! Per-connection SMTP session.
//!
//! Runs the tarpit state machine over one socket: stuttered one-byte
//! writes, a 400-second cap on any single read or write, command handling
//! with QUIT/RSET shortcuts, and the grey-event dispatch once the peer has
//! revealed sender and recipient.

use super::reply;
use super::server::ServerShared;
use super::{
    summarize_lists, MatchedList, SmtpState, CON_BUF_SIZE, CON_CLIENT_TOLERANCE,
    CON_MAX_BAD_CMD, CON_MAX_DATA_LINES, DNAT_LOOKUP_TIMEOUT, MAX_TIME,
};
use crate::error::{GreytrapError, Result};
use crate::firewall::FwRequest;
use crate::grey::GREY_MSG_GREY;
use crate::proto::{self, Message};
use crate::store::normalize_email_addr;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info};

/// What one state-machine step asks the driver loop to do.
#[derive(Debug, Default, PartialEq)]
struct Step {
    reply: Option<String>,
    grey_event: bool,
}

pub struct Session {
    shared: Arc<ServerShared>,
    state: SmtpState,
    src_ip: String,
    src_port: u16,
    local: SocketAddr,
    dst_addr: String,
    helo: String,
    mail: String,
    rcpt: String,
    lists: Vec<MatchedList>,
    summary: Option<String>,
    stutter: u64,
    started: Instant,
    bad_cmd: u32,
    data_lines: u32,
    data_body: bool,
    seen_cr: bool,
}

impl Session {
    /// Build the connection record: resolve blacklist membership, pick the
    /// stutter and bump the client counters.
    pub async fn new(shared: Arc<ServerShared>, peer: SocketAddr, local: SocketAddr) -> Self {
        let src_ip = peer.ip().to_string();
        let lists = shared.matching_lists(&peer.ip()).await;
        let summary = summarize_lists(&lists);

        let mut stutter = shared.stutter;
        if lists.is_empty() && shared.grey_enabled && shared.grey_stutter == 0 {
            stutter = 0;
        }

        shared.clients.fetch_add(1, Ordering::Relaxed);
        if !lists.is_empty() {
            let black = shared.black_clients.fetch_add(1, Ordering::Relaxed) + 1;
            // Too many tarpitted peers: stop stuttering to shed them.
            if shared.grey_enabled && black > shared.max_black {
                stutter = 0;
            }
        }

        let session = Session {
            shared,
            state: SmtpState::BannerIn,
            src_ip,
            src_port: peer.port(),
            local,
            dst_addr: String::new(),
            helo: String::new(),
            mail: String::new(),
            rcpt: String::new(),
            lists,
            summary,
            stutter,
            started: Instant::now(),
            bad_cmd: 0,
            data_lines: 0,
            data_body: false,
            seen_cr: false,
        };

        info!(
            "{}: connected ({}/{}){}{}",
            session.src_ip,
            session.shared.clients.load(Ordering::Relaxed),
            session.shared.black_clients.load(Ordering::Relaxed),
            if session.summary.is_some() { ", lists: " } else { "" },
            session.summary.as_deref().unwrap_or("")
        );

        session
    }

    /// Drive the session to completion over the given stream, or drop it
    /// on daemon shutdown.
    pub async fn handle<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let shutdown = self.shared.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = self.drive(stream) => result,
        }
    }

    async fn drive<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let banner = self.banner_line();
        self.state = SmtpState::BannerOut;
        self.write_output(&mut writer, &banner).await?;
        self.after_write();

        loop {
            match self.state {
                SmtpState::Close => return Ok(()),
                SmtpState::Reply => {
                    let out = reply::build_reply(&self.lists, &self.shared.reply_code, &self.src_ip);
                    self.state = SmtpState::Close;
                    self.write_output(&mut writer, &out).await?;
                }
                SmtpState::HeloIn
                | SmtpState::MailIn
                | SmtpState::RcptIn
                | SmtpState::DataIn
                | SmtpState::Message => {
                    let line = self.read_line(&mut reader).await?;
                    let step = self.advance(&line);
                    if step.grey_event {
                        self.dispatch_grey().await;
                    }
                    if let Some(out) = step.reply {
                        self.write_output(&mut writer, &out).await?;
                    }
                    self.after_write();
                }
                _ => self.after_write(),
            }
        }
    }

    /// One state-machine transition on a received line.
    fn advance(&mut self, line: &str) -> Step {
        let mut step = Step::default();

        if starts_with_ci(line, "QUIT") && self.state < SmtpState::Close {
            step.reply = Some(format!("221 {}\r\n", self.shared.hostname));
            self.state = SmtpState::Close;
            return step;
        }

        if starts_with_ci(line, "RSET")
            && self.state > SmtpState::HeloOut
            && self.state < SmtpState::DataIn
        {
            step.reply = Some("250 OK\r\n".to_string());
            self.state = SmtpState::HeloOut;
            return step;
        }

        if self.state == SmtpState::Message {
            self.process_body_line(line);
            return step;
        }

        let mut state = self.state;

        if state == SmtpState::HeloIn {
            if starts_with_ci(line, "HELO") || starts_with_ci(line, "EHLO") {
                self.helo = parse_helo(line);
                if self.helo.is_empty() {
                    let verb = if starts_with_ci(line, "HELO") {
                        "HELO"
                    } else {
                        "EHLO"
                    };
                    step.reply = Some(format!("501 Syntax: {verb} hostname\r\n"));
                    self.state = SmtpState::BannerOut;
                } else {
                    step.reply = Some(format!("250 {}\r\n", self.shared.hostname));
                    self.state = SmtpState::HeloOut;
                }
                return step;
            }
            state = SmtpState::MailIn;
        }

        if state == SmtpState::MailIn {
            if starts_with_ci(line, "MAIL") {
                self.mail = normalize_email_addr(&parse_addr_arg(line));
                step.reply = Some("250 OK\r\n".to_string());
                self.state = SmtpState::MailOut;
                return step;
            }
            state = SmtpState::RcptIn;
        }

        if state == SmtpState::RcptIn {
            if starts_with_ci(line, "RCPT") {
                self.rcpt = normalize_email_addr(&parse_addr_arg(line));
                step.reply = Some("250 OK\r\n".to_string());
                self.state = SmtpState::RcptOut;

                if !self.mail.is_empty() && !self.rcpt.is_empty() {
                    debug!(
                        "({}) {}: {} -> {}",
                        if self.lists.is_empty() { "GREY" } else { "BLACK" },
                        self.src_ip,
                        self.mail,
                        self.rcpt
                    );
                    if self.shared.grey_enabled && self.lists.is_empty() {
                        step.grey_event = true;
                    }
                } else {
                    debug!("incomplete sender and/or recipient; not sending to greylister");
                }
                return step;
            }
        }

        // Anything else lands in the data-phase handler.
        if starts_with_ci(line, "DATA") {
            step.reply = Some("354 End data with <CR><LF>.<CR><LF>\r\n".to_string());
            self.state = SmtpState::DataOut;
            if self.shared.grey_enabled && self.lists.is_empty() {
                // Greylisted peers never see the data phase.
                step.reply = None;
                self.state = SmtpState::Reply;
            }
        } else if starts_with_ci(line, "NOOP") {
            step.reply = Some("250 OK\r\n".to_string());
        } else {
            self.bad_cmd += 1;
            if self.bad_cmd > CON_MAX_BAD_CMD {
                self.state = SmtpState::Reply;
            } else {
                step.reply = Some("500 Command unrecognized\r\n".to_string());
            }
        }

        step
    }

    fn process_body_line(&mut self, line: &str) {
        if line == "." {
            self.state = SmtpState::Reply;
            return;
        }

        if self.data_body {
            self.data_lines += 1;
            if self.data_lines >= CON_MAX_DATA_LINES {
                self.state = SmtpState::Reply;
                return;
            }
        }

        if !self.data_body && line.is_empty() {
            self.data_body = true;
        } else if self.shared.verbose {
            if self.data_body && !line.is_empty() {
                info!("{}: Body: {}", self.src_ip, line);
            } else if starts_with_ci(line, "FROM:")
                || starts_with_ci(line, "TO:")
                || starts_with_ci(line, "SUBJECT:")
            {
                info!("{}: {}", self.src_ip, line);
            }
        }
    }

    /// Output states hand straight back to the matching input state.
    fn after_write(&mut self) {
        self.state = match self.state {
            SmtpState::BannerOut => SmtpState::HeloIn,
            SmtpState::HeloOut => SmtpState::MailIn,
            SmtpState::MailOut => SmtpState::RcptIn,
            SmtpState::RcptOut => SmtpState::RcptIn,
            SmtpState::DataOut => SmtpState::Message,
            state => state,
        };
    }

    fn banner_line(&self) -> String {
        let human_time = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
        format!(
            "220 {} ESMTP {}; {}\r\n",
            self.shared.hostname, self.shared.banner, human_time
        )
    }

    /// Ask the firewall helper for the pre-DNAT destination, then emit the
    /// grey event. The lookup is bounded by a short timeout and the event
    /// proceeds with an empty destination when it expires.
    async fn dispatch_grey(&mut self) {
        self.dst_addr = self.lookup_orig_dst().await;

        let message = Message::new()
            .set_int("type", GREY_MSG_GREY)
            .set_str("dst_ip", &self.dst_addr)
            .set_str("ip", &self.src_ip)
            .set_str("helo", &self.helo)
            .set_str("from", &self.mail)
            .set_str("to", &self.rcpt);

        let _ = self.shared.grey_tx.send(message.emit());
    }

    async fn lookup_orig_dst(&self) -> String {
        let request = Message::new()
            .set_str("type", "nat")
            .set_str("src", &self.src_ip)
            .set_int("src_port", self.src_port as i64)
            .set_str("proxy", &self.local.ip().to_string())
            .set_int("proxy_port", self.local.port() as i64)
            .emit();

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .fw_tx
            .send(FwRequest {
                message: request,
                reply: reply_tx,
            })
            .is_err()
        {
            return String::new();
        }

        match timeout(Duration::from_millis(DNAT_LOOKUP_TIMEOUT), reply_rx).await {
            Ok(Ok(text)) => proto::parse(&text)
                .ok()
                .and_then(|m| m.get_str("dst").map(str::to_string))
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Read one line, bounded by the per-read deadline and the input
    /// buffer size. A full buffer without a terminator is treated as a
    /// complete line, like the fixed input buffer it replaces.
    async fn read_line<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> Result<String> {
        let mut line: Vec<u8> = Vec::new();

        loop {
            let buf = timeout(Duration::from_secs(MAX_TIME), reader.fill_buf())
                .await
                .map_err(|_| GreytrapError::SmtpProtocol("read timed out".to_string()))??;

            if buf.is_empty() {
                return Err(GreytrapError::SmtpProtocol(
                    "client disconnected".to_string(),
                ));
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                break;
            }

            line.extend_from_slice(buf);
            let used = line.len().min(CON_BUF_SIZE);
            let consumed = buf.len();
            reader.consume(consumed);
            if used >= CON_BUF_SIZE {
                line.truncate(CON_BUF_SIZE);
                break;
            }
        }

        while line.last() == Some(&b'\r') {
            line.pop();
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Write output, one byte at a time while stuttering, injecting a `\r`
    /// before any bare `\n`. Stutter is dropped when the daemon is close
    /// to its connection ceiling, and for greylisted peers once the
    /// session has outlived the grey-stutter window.
    async fn write_output<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, out: &str) -> Result<()> {
        let bytes = out.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            self.maybe_cancel_grey_stutter();
            let within_max = self.shared.clients.load(Ordering::Relaxed) + CON_CLIENT_TOLERANCE
                < self.shared.max_cons;

            if self.stutter > 0 && within_max {
                let b = bytes[i];
                if b == b'\n' && !self.seen_cr {
                    self.write_all_deadline(writer, b"\r").await?;
                }
                self.seen_cr = b == b'\r';
                self.write_all_deadline(writer, &bytes[i..=i]).await?;
                i += 1;
                tokio::time::sleep(Duration::from_secs(self.stutter)).await;
            } else {
                let mut fixed = Vec::with_capacity(bytes.len() - i + 8);
                for &b in &bytes[i..] {
                    if b == b'\n' && !self.seen_cr {
                        fixed.push(b'\r');
                    }
                    self.seen_cr = b == b'\r';
                    fixed.push(b);
                }
                self.write_all_deadline(writer, &fixed).await?;
                i = bytes.len();
            }
        }

        writer.flush().await?;
        Ok(())
    }

    async fn write_all_deadline<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        buf: &[u8],
    ) -> Result<()> {
        timeout(Duration::from_secs(MAX_TIME), writer.write_all(buf))
            .await
            .map_err(|_| GreytrapError::SmtpProtocol("write timed out".to_string()))??;
        Ok(())
    }

    fn maybe_cancel_grey_stutter(&mut self) {
        if self.stutter > 0
            && self.shared.grey_enabled
            && self.lists.is_empty()
            && self.started.elapsed().as_secs() > self.shared.grey_stutter
        {
            self.stutter = 0;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.clients.fetch_sub(1, Ordering::Relaxed);
        if !self.lists.is_empty() {
            self.shared.black_clients.fetch_sub(1, Ordering::Relaxed);
        }

        info!(
            "{}: disconnected after {} seconds.{}{}",
            self.src_ip,
            self.started.elapsed().as_secs(),
            if self.summary.is_some() { " lists: " } else { "" },
            self.summary.as_deref().unwrap_or("")
        );
    }
}

fn starts_with_ci(line: &str, prefix: &str) -> bool {
    let line = line.as_bytes();
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Hostname argument of a HELO/EHLO line.
fn parse_helo(line: &str) -> String {
    line[4..]
        .trim_start_matches([' ', '\t'])
        .split([' ', '\t'])
        .next()
        .unwrap_or("")
        .to_string()
}

/// Address argument of a MAIL FROM: / RCPT TO: line, still un-normalised.
fn parse_addr_arg(line: &str) -> String {
    match line.split_once(':') {
        Some((_, rest)) => rest
            .trim_start_matches([' ', '\t'])
            .split([' ', '\t'])
            .next()
            .unwrap_or("")
            .to_string(),
        None => String::new(),
    }
}
