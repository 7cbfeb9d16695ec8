use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub struct SmtpTestClient {
    stream: BufReader<TcpStream>,
}

impl SmtpTestClient {
    /// Connect and consume the 220 greeting.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, String), String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect to SMTP: {}", e))?;

        let mut client = Self {
            stream: BufReader::new(stream),
        };

        let greeting = client.read_line().await?;
        if !greeting.starts_with("220") {
            return Err(format!("Unexpected greeting: {}", greeting));
        }

        Ok((client, greeting))
    }

    pub async fn command(&mut self, line: &str) -> Result<String, String> {
        self.send_line(line).await?;
        self.read_line().await
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), String> {
        self.stream
            .get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| format!("Failed to send command: {}", e))
    }

    pub async fn read_line(&mut self) -> Result<String, String> {
        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        if n == 0 {
            return Err("Connection closed".to_string());
        }
        Ok(line.trim_end().to_string())
    }

    /// Read until the connection closes, returning every line seen.
    pub async fn read_to_end(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.read_line().await {
            lines.push(line);
        }
        lines
    }
}
