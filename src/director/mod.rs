//! Per-server orchestration
//!
//! A [`Director`] binds one listener to the shared resolver and ruleset and
//! to the server's router and connectors. Every connection the listener
//! hands over runs through the same fixed pipeline:
//!
//! 1. derive a [`ConnContext`] (fresh child cancellation token, span)
//! 2. route
//! 3. resolve the destination and rewrite it to the IP
//! 4. evaluate the ruleset, telling the reply sink the outcome
//! 5. select a connector by network and let it dial and serve
//!
//! The pipeline ends at the dial outcome. What remains is a [`Relay`] that
//! serves the connection until it closes; [`Director::drive`] runs it in
//! place, while the queued [`Dispatcher`] hands it to a task of its own so
//! its workers only ever wait on dials.

mod context;
mod dispatcher;

pub use context::ConnContext;
pub use dispatcher::{DispatchSnapshot, DispatchStats, Dispatcher};

use crate::connector::{ConnectorSelector, Session};
use crate::error::{ProxyError, Result};
use crate::listener::{Connection, ConnectionHandler, Listener, ReplySink};
use crate::resolver::Resolver;
use crate::router::Router;
use crate::ruleset::{Outcome, Permit, Ruleset};
use crate::transport::Address;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Orchestrates one server's connections
pub struct Director {
    name: String,
    listener: Arc<dyn Listener>,
    router: Arc<dyn Router>,
    resolver: Arc<Resolver>,
    ruleset: Arc<Ruleset>,
    connectors: ConnectorSelector,
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Director")
            .field("name", &self.name)
            .field("listener", &self.listener)
            .field("router", &self.router)
            .field("rules", &self.ruleset.rule_count())
            .finish()
    }
}

/// Collects a [`Director`]'s collaborators
#[derive(Default)]
pub struct DirectorBuilder {
    name: String,
    listener: Option<Arc<dyn Listener>>,
    router: Option<Arc<dyn Router>>,
    resolver: Option<Arc<Resolver>>,
    ruleset: Option<Arc<Ruleset>>,
    connectors: Option<ConnectorSelector>,
}

impl DirectorBuilder {
    /// Listener that feeds the director
    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Router deciding destinations
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Shared resolver
    pub fn resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Shared ruleset
    pub fn ruleset(mut self, ruleset: Arc<Ruleset>) -> Self {
        self.ruleset = Some(ruleset);
        self
    }

    /// Connector selector
    pub fn connectors(mut self, connectors: ConnectorSelector) -> Self {
        self.connectors = Some(connectors);
        self
    }

    /// Fail unless every collaborator is present
    pub fn build(self) -> Result<Director> {
        let missing = |what: &str| ProxyError::Config(format!("server {} has no {}", self.name, what));
        Ok(Director {
            listener: self.listener.ok_or_else(|| missing("listener"))?,
            router: self.router.ok_or_else(|| missing("router"))?,
            resolver: self.resolver.ok_or_else(|| missing("resolver"))?,
            ruleset: self.ruleset.ok_or_else(|| missing("ruleset"))?,
            connectors: self.connectors.ok_or_else(|| missing("connector selector"))?,
            name: self.name,
        })
    }
}

impl Director {
    /// Start building a director for the server called `name`
    pub fn builder(name: &str) -> DirectorBuilder {
        DirectorBuilder {
            name: name.to_string(),
            ..DirectorBuilder::default()
        }
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listener feeding this director
    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    /// Accept and drive connections until `ctx` is cancelled or the
    /// listener fails
    pub async fn serve(self: Arc<Self>, ctx: CancellationToken) -> Result<()> {
        let listener = self.listener.clone();
        info!(
            "Server {} serving {} on {}",
            self.name,
            listener.protocol(),
            listener.local_addr()?
        );
        listener.serve(ctx, self).await
    }

    /// Run one connection through the pipeline, serve it and log how it
    /// ended
    pub async fn drive(&self, server: &CancellationToken, conn: Connection, sink: Box<dyn ReplySink>) {
        if let Some(relay) = self.dial(server, conn, sink).await {
            relay.run().await;
        }
    }

    /// Run the pipeline up to the dial outcome.
    ///
    /// The connection's admission slot is released before returning. `None`
    /// means the connection already ended and has been logged.
    pub async fn dial(
        &self,
        server: &CancellationToken,
        mut conn: Connection,
        mut sink: Box<dyn ReplySink>,
    ) -> Option<Relay> {
        let slot = conn.take_reservation();
        let ctx = ConnContext::new(&self.name, conn.source, server);
        let span = ctx.span.clone();
        let result = self.pipeline(&ctx, conn, sink.as_mut()).instrument(span).await;
        drop(slot);

        match result {
            Ok(session) => Some(Relay { ctx, session }),
            Err(e) => {
                log_end(&ctx, Err(e));
                None
            }
        }
    }

    async fn pipeline(&self, ctx: &ConnContext, conn: Connection, sink: &mut dyn ReplySink) -> Result<Session> {
        let mut conn = self.router.route(ctx, conn).await?;
        if !conn.destination.is_valid() {
            return Err(ProxyError::Routing(format!(
                "router left {} without a network",
                conn.destination
            )));
        }

        let requested = conn.destination.clone();
        let ip = match self.resolver.resolve(&ctx.cancel, &conn.destination.address).await {
            Ok(ip) => ip,
            Err(e) => {
                let unreachable = io::Error::new(io::ErrorKind::HostUnreachable, e.to_string());
                if let Err(reply) = sink.on_dial_outcome(&mut conn.inbound, Err(&unreachable)).await {
                    debug!("Failed to report resolution failure: {}", reply);
                }
                conn.close().await;
                return Err(e);
            }
        };
        conn.destination.set_resolved(ip);
        if requested.address.is_domain() {
            debug!("Resolved {} to {}", requested, ip);
        }

        let permit = Permit {
            source: Address::from(conn.source.ip()),
            destination: conn.destination.clone(),
        };
        let outcome = self.ruleset.allow(&permit);
        sink.on_ruleset_decision(&mut conn.inbound, &outcome).await?;
        if let Outcome::Deny(reason) = outcome {
            conn.close().await;
            return Err(ProxyError::RulesetDenial(reason));
        }

        let connector = self.connectors.select(&conn).ok_or_else(|| {
            ProxyError::Config(format!(
                "server {} has no connector for {} {}",
                self.name,
                conn.inbound.kind(),
                conn.destination
            ))
        })?;
        debug!("Dialing {} with {} connector", conn.destination, connector.name());
        connector.dial(ctx, conn, sink).await
    }
}

/// A dialed connection left to relay
pub struct Relay {
    ctx: ConnContext,
    session: Session,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay").field("id", &self.ctx.id).finish()
    }
}

impl Relay {
    /// Serve the connection until it ends and log how it ended
    pub async fn run(self) {
        let Relay { ctx, session } = self;
        let result = session.instrument(ctx.span.clone()).await;
        log_end(&ctx, result);
    }
}

fn log_end(ctx: &ConnContext, result: Result<()>) {
    let elapsed = ctx.elapsed();
    match result {
        Ok(()) => info!(parent: &ctx.span, "Connection closed after {:?}", elapsed),
        Err(e) if e.is_benign() => {
            info!(parent: &ctx.span, "Connection ended after {:?}: {}", elapsed, e)
        }
        Err(ProxyError::RulesetDenial(reason)) => {
            info!(parent: &ctx.span, "Connection denied after {:?}: {}", elapsed, reason)
        }
        Err(e) => warn!(parent: &ctx.span, "Connection failed after {:?}: {}", elapsed, e),
    }
}

#[async_trait]
impl ConnectionHandler for Director {
    async fn handle(&self, ctx: &CancellationToken, conn: Connection, sink: Box<dyn ReplySink>) {
        self.drive(ctx, conn, sink).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResolverConfig, RuleAction, RuleConfig, RuleTarget};
    use crate::connector::{finished, Connector};
    use crate::listener::{DialOutcome, Inbound, Reservation};
    use crate::resolver::Lookup;
    use crate::router::ClientRouter;
    use crate::ruleset::LoopbackRule;
    use crate::transport::{Destination, Network};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;
    use tokio::io::duplex;

    #[derive(Debug)]
    struct FixedLookup(Option<IpAddr>);

    #[async_trait]
    impl Lookup for FixedLookup {
        async fn lookup(&self, name: &str) -> io::Result<IpAddr> {
            self.0
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", name)))
        }
    }

    /// Records what reached it and succeeds without dialing
    #[derive(Debug, Default)]
    struct RecordingConnector {
        seen: Mutex<Vec<Destination>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn dial(&self, ctx: &ConnContext, mut conn: Connection, sink: &mut dyn ReplySink) -> Result<Session> {
            assert!(!ctx.is_cancelled());
            self.seen.lock().unwrap().push(conn.destination.clone());
            sink.on_dial_outcome(&mut conn.inbound, Ok(None)).await?;
            Ok(finished())
        }
    }

    #[derive(Default, Clone)]
    struct Events(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl ReplySink for Events {
        async fn on_ruleset_decision(&mut self, _: &mut Inbound, outcome: &Outcome) -> io::Result<()> {
            self.0.lock().unwrap().push(format!("rule:{}", outcome));
            Ok(())
        }

        async fn on_dial_outcome(&mut self, _: &mut Inbound, outcome: DialOutcome<'_>) -> io::Result<()> {
            let event = match outcome {
                Ok(_) => "dial:ok".to_string(),
                Err(e) => format!("dial:{:?}", e.kind()),
            };
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Listener stand-in; the pipeline tests call `drive` directly
    #[derive(Debug)]
    struct NoListener;

    #[async_trait]
    impl Listener for NoListener {
        fn protocol(&self) -> &'static str {
            "none"
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:1080".parse().unwrap())
        }

        async fn serve(&self, _: CancellationToken, _: Arc<dyn ConnectionHandler>) -> Result<()> {
            Ok(())
        }
    }

    fn director(lookup: Option<IpAddr>, rules: &[RuleConfig], connector: Arc<RecordingConnector>) -> Director {
        let loopback = LoopbackRule::new(vec![(Network::Tcp, "127.0.0.1:1080".parse().unwrap())]);
        Director::builder("test")
            .listener(Arc::new(NoListener))
            .router(Arc::new(ClientRouter))
            .resolver(Arc::new(Resolver::with_lookup(
                &ResolverConfig::default(),
                Box::new(FixedLookup(lookup)),
            )))
            .ruleset(Arc::new(Ruleset::from_config(loopback, rules)))
            .connectors(ConnectorSelector::new().tcp(connector))
            .build()
            .unwrap()
    }

    fn connection(host: &str, port: u16) -> Connection {
        let (inbound, _client) = duplex(16);
        Connection::new(
            Network::Tcp,
            "192.168.1.10:40000".parse().unwrap(),
            Destination::tcp(Address::parse(host), port),
            Inbound::Stream(Box::new(inbound)),
        )
    }

    fn deny_ten() -> RuleConfig {
        RuleConfig {
            action: RuleAction::Deny,
            target: RuleTarget::Destination,
            cidrs: vec!["10.0.0.0/8".parse().unwrap()],
        }
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Director::builder("incomplete")
            .listener(Arc::new(NoListener))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        assert!(err.to_string().contains("router"));
    }

    #[tokio::test]
    async fn test_pipeline_resolves_before_dial() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))), &[], connector.clone());
        let events = Events::default();

        director
            .drive(&CancellationToken::new(), connection("example.com", 80), Box::new(events.clone()))
            .await;

        assert_eq!(
            *connector.seen.lock().unwrap(),
            vec![Destination::tcp(Address::parse("93.184.216.34"), 80)]
        );
        assert_eq!(*events.0.lock().unwrap(), vec!["rule:no match", "dial:ok"]);
    }

    #[tokio::test]
    async fn test_dial_releases_slot_before_relay() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(None, &[], connector.clone());
        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let conn = connection("192.0.2.7", 80).with_reservation(Reservation::new(permit));

        let relay = director
            .dial(&CancellationToken::new(), conn, Box::new(Events::default()))
            .await
            .unwrap();
        assert_eq!(semaphore.available_permits(), 1);
        assert_eq!(connector.seen.lock().unwrap().len(), 1);
        relay.run().await;
    }

    #[tokio::test]
    async fn test_failed_dial_yields_no_relay() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(None, &[deny_ten()], connector);
        let relay = director
            .dial(&CancellationToken::new(), connection("10.0.0.1", 22), Box::new(Events::default()))
            .await;
        assert!(relay.is_none());
    }

    #[tokio::test]
    async fn test_denied_destination_never_dialed() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(None, &[deny_ten()], connector.clone());
        let events = Events::default();

        let result = director
            .pipeline(
                &ConnContext::new("test", "192.168.1.10:40000".parse().unwrap(), &CancellationToken::new()),
                connection("10.20.30.40", 443),
                &mut events.clone(),
            )
            .await;

        assert!(matches!(result, Err(ProxyError::RulesetDenial(_))));
        assert!(connector.seen.lock().unwrap().is_empty());
        let events = events.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("rule:deny"));
    }

    #[tokio::test]
    async fn test_loopback_listener_denied() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), &[], connector.clone());
        let mut events = Events::default();

        let result = director
            .pipeline(
                &ConnContext::new("test", "192.168.1.10:40000".parse().unwrap(), &CancellationToken::new()),
                connection("localhost", 1080),
                &mut events,
            )
            .await;
        assert!(matches!(result, Err(ProxyError::RulesetDenial(_))));
        assert!(connector.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_failure_replies_unreachable() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(None, &[], connector.clone());
        let events = Events::default();

        let result = director
            .pipeline(
                &ConnContext::new("test", "192.168.1.10:40000".parse().unwrap(), &CancellationToken::new()),
                connection("nowhere.invalid", 80),
                &mut events.clone(),
            )
            .await;

        assert!(matches!(result, Err(ProxyError::Resolution { .. })));
        assert_eq!(*events.0.lock().unwrap(), vec!["dial:HostUnreachable"]);
        assert!(connector.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_connection_gets_no_reply() {
        let connector = Arc::new(RecordingConnector::default());
        let director = director(None, &[], connector);
        let events = Events::default();
        let (inbound, _client) = duplex(16);
        let conn = Connection::new(
            Network::Tcp,
            "192.168.1.10:40000".parse().unwrap(),
            Destination::default(),
            Inbound::Stream(Box::new(inbound)),
        );

        let result = director
            .pipeline(
                &ConnContext::new("test", "192.168.1.10:40000".parse().unwrap(), &CancellationToken::new()),
                conn,
                &mut events.clone(),
            )
            .await;
        assert!(matches!(result, Err(ProxyError::Routing(_))));
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_connector_is_config_error() {
        let director = Director::builder("udp-less")
            .listener(Arc::new(NoListener))
            .router(Arc::new(ClientRouter))
            .resolver(Arc::new(Resolver::new(&ResolverConfig::default())))
            .ruleset(Arc::new(Ruleset::from_config(LoopbackRule::new(vec![]), &[])))
            .connectors(ConnectorSelector::new())
            .build()
            .unwrap();

        let result = director
            .pipeline(
                &ConnContext::new("test", "192.168.1.10:40000".parse().unwrap(), &CancellationToken::new()),
                connection("192.0.2.1", 80),
                &mut Events::default(),
            )
            .await;
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }
}
