use std::{net::SocketAddr, time::Duration};

use meter_client::{
    db::consumption_queries::{CONSUMPTION_FIELD, FUEL_TYPE_TAG},
    domain::Reading,
};
use time::OffsetDateTime;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{Mutex, MutexGuard},
};

use crate::pipeline::{PointSink, SyncError};

/// Escape measurement/tag keys/tag values/field keys for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    ilp_escape_ident(key, out);
    out.push('=');
    ilp_escape_ident(value, out);
}

fn push_field_f64(out: &mut String, key: &str, value: f64) {
    ilp_escape_ident(key, out);
    out.push('=');
    out.push_str(&value.to_string());
}

fn ts_to_unix_nanos(ts: OffsetDateTime) -> i128 {
    ts.unix_timestamp_nanos()
}

/// One ILP line (newline terminated) for a consumption reading.
pub fn encode_point(measurement: &str, reading: &Reading, out: &mut String) {
    ilp_escape_ident(measurement, out);
    push_tag(out, FUEL_TYPE_TAG, reading.fuel.as_str());

    out.push(' ');
    push_field_f64(out, CONSUMPTION_FIELD, reading.consumption);

    out.push(' ');
    out.push_str(&ts_to_unix_nanos(reading.period_start).to_string());
    out.push('\n');
}

/// Connection held for one write. Unless the write completed, the connection
/// is discarded on drop, since it may carry a partial line.
struct WriteGuard<'a> {
    conn: MutexGuard<'a, Option<TcpStream>>,
    completed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *self.conn = None;
        }
    }
}

/// Writes each reading as its own ILP line over a lazily opened TCP
/// connection. Every write is bounded by `write_timeout`.
pub struct QuestDbIlpSink {
    addr: SocketAddr,
    measurement: String,
    write_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl QuestDbIlpSink {
    pub fn new(addr: SocketAddr, measurement: impl Into<String>, write_timeout: Duration) -> Self {
        Self {
            addr,
            measurement: measurement.into(),
            write_timeout,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.write_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Open the connection up front so an unreachable endpoint fails the run
    /// before anything is fetched.
    pub async fn check_connection(&self) -> Result<(), SyncError> {
        let stream = self.connect().await.map_err(|e| {
            SyncError::Connection(format!("failed to connect to QuestDB ILP at {}: {e}", self.addr))
        })?;
        *self.conn.lock().await = Some(stream);
        Ok(())
    }

    /// Best-effort flush of the underlying connection.
    pub async fn close(&self) {
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[async_trait::async_trait]
impl PointSink for QuestDbIlpSink {
    async fn write_point(&self, reading: &Reading) -> Result<(), SyncError> {
        let mut line = String::with_capacity(64);
        encode_point(&self.measurement, reading, &mut line);

        let mut guard = WriteGuard {
            conn: self.conn.lock().await,
            completed: false,
        };
        let res = tokio::time::timeout(self.write_timeout, async {
            if guard.conn.is_none() {
                *guard.conn = Some(self.connect().await?);
            }
            match &mut *guard.conn {
                Some(stream) => {
                    stream.write_all(line.as_bytes()).await?;
                    stream.flush().await
                }
                None => Ok(()),
            }
        })
        .await;

        let err = match res {
            Ok(Ok(())) => {
                guard.completed = true;
                metrics::counter!("questdb_ilp_bytes_total").increment(line.len() as u64);
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.write_timeout),
        };

        Err(SyncError::Write {
            fuel: reading.fuel,
            message: format!("ilp write failed: {err}"),
        })
    }
}
