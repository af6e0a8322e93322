use super::{Connector, Session};
use crate::director::ConnContext;
use crate::error::{ProxyError, Result};
use crate::listener::{Connection, ReplySink};
use async_trait::async_trait;
use std::io;

/// Refuses every connection it is given
#[derive(Debug, Clone)]
pub struct RejectConnector {
    reason: String,
}

impl RejectConnector {
    /// Create a connector failing with `reason`
    pub fn new(reason: &str) -> Self {
        RejectConnector {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for RejectConnector {
    fn name(&self) -> &'static str {
        "reject"
    }

    async fn dial(
        &self,
        _ctx: &ConnContext,
        mut conn: Connection,
        sink: &mut dyn ReplySink,
    ) -> Result<Session> {
        let err = io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("connection refused: {}", self.reason),
        );
        sink.on_dial_outcome(&mut conn.inbound, Err(&err)).await?;
        conn.close().await;
        Err(ProxyError::Dial(err))
    }
}
