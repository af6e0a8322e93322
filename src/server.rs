//! Process bootstrap
//!
//! Binds every configured server, builds the resolver and ruleset they
//! share, and wires one [`Director`] per server. Listeners are bound before
//! the ruleset is built so the loopback guard knows the real endpoints,
//! including ports the OS picked.

use crate::auth::{Authenticator, UserTable};
use crate::config::{Config, ListenNetwork, Protocol, ServerConfig};
use crate::connector::{
    ConnectorSelector, HttpConnector, RejectConnector, TcpConnector, UdpConnector,
};
use crate::director::{Director, Dispatcher};
use crate::listener::{
    ForwardTcpListener, ForwardUdpListener, HttpListener, Listener, SocksListener,
};
use crate::resolver::Resolver;
use crate::router::{ClientRouter, ForwardRouter, Router};
use crate::ruleset::{LoopbackRule, Ruleset};
use crate::transport::{Network, SocketOpts};
use anyhow::{anyhow, Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

enum Service {
    Inline(Arc<Director>),
    Queued(Arc<Dispatcher>),
}

impl Service {
    fn director(&self) -> &Director {
        match self {
            Service::Inline(director) => director,
            Service::Queued(dispatcher) => dispatcher.director(),
        }
    }

    async fn serve(self, ctx: CancellationToken) -> crate::error::Result<()> {
        match self {
            Service::Inline(director) => director.serve(ctx).await,
            Service::Queued(dispatcher) => dispatcher.serve(ctx).await,
        }
    }
}

/// All configured servers, bound and wired
pub struct Server {
    services: Vec<Service>,
    resolver: Arc<Resolver>,
    ruleset: Arc<Ruleset>,
}

impl Server {
    /// Bind every server in `config` and build its pipeline
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate()?;

        let users: Arc<dyn Authenticator> = Arc::new(UserTable::new(config.users.clone()));
        let mut bound = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let authenticator = server.auth.then(|| users.clone());
            let listener = bind_listener(server, authenticator).await.with_context(|| {
                format!(
                    "Failed to bind server '{}' on {}/{:?}",
                    server.name,
                    server.listen_addr(),
                    server.network
                )
            })?;
            bound.push((server, listener));
        }

        let endpoints = bound
            .iter()
            .map(|(server, listener)| -> io::Result<(Network, SocketAddr)> {
                Ok((Network::from(server.network), listener.local_addr()?))
            })
            .collect::<io::Result<Vec<_>>>()
            .context("Failed to read listener address")?;

        let resolver = Arc::new(Resolver::new(&config.resolver));
        let ruleset = Arc::new(Ruleset::from_config(
            LoopbackRule::new(endpoints),
            &config.rules,
        ));

        let mut services = Vec::with_capacity(bound.len());
        for (server, listener) in bound {
            let director = Director::builder(&server.name)
                .listener(listener)
                .router(router(server)?)
                .resolver(resolver.clone())
                .ruleset(ruleset.clone())
                .connectors(connectors(server))
                .build()?;
            let director = Arc::new(director);

            services.push(match &server.dispatch {
                Some(dispatch) => Service::Queued(Arc::new(Dispatcher::new(director, dispatch))),
                None => Service::Inline(director),
            });
        }

        Ok(Server {
            services,
            resolver,
            ruleset,
        })
    }

    /// Bound address of the server called `name`
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.services
            .iter()
            .map(Service::director)
            .find(|director| director.name() == name)
            .and_then(|director| director.listener().local_addr().ok())
    }

    /// The shared resolver
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// The shared ruleset
    pub fn ruleset(&self) -> &Arc<Ruleset> {
        &self.ruleset
    }

    /// Serve until `ctx` is cancelled or one server fails. A failing server
    /// stops all the others.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        let ctx = ctx.child_token();
        info!("Starting {} servers", self.services.len());

        let serves = self.services.into_iter().map(|service| {
            let ctx = ctx.clone();
            let name = service.director().name().to_string();
            async move {
                service.serve(ctx).await.map_err(|e| {
                    error!("Server {} failed: {}", name, e);
                    anyhow!(e).context(format!("Server '{}' failed", name))
                })
            }
        });
        let result = futures::future::try_join_all(serves).await;

        ctx.cancel();
        result?;
        info!("All servers stopped");
        Ok(())
    }
}

/// Bind and serve `config` until `ctx` is cancelled
pub async fn run_server(config: Config, ctx: CancellationToken) -> Result<()> {
    Server::bind(&config).await?.run(ctx).await
}

async fn bind_listener(
    server: &ServerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> io::Result<Arc<dyn Listener>> {
    let listener: Arc<dyn Listener> = match (server.protocol, server.network) {
        (Protocol::Socks5, _) => Arc::new(SocksListener::bind(server, authenticator).await?),
        (Protocol::Http, _) => Arc::new(HttpListener::bind(server, authenticator).await?),
        (Protocol::Forward, ListenNetwork::Tcp) => Arc::new(ForwardTcpListener::bind(server).await?),
        (Protocol::Forward, ListenNetwork::Udp) => Arc::new(ForwardUdpListener::bind(server).await?),
    };
    Ok(listener)
}

fn router(server: &ServerConfig) -> Result<Arc<dyn Router>> {
    match server.protocol {
        Protocol::Forward => {
            let destination = server
                .forward_destination()
                .ok_or_else(|| anyhow!("Server '{}': invalid forward_to", server.name))?;
            Ok(Arc::new(ForwardRouter::new(destination)))
        }
        Protocol::Socks5 | Protocol::Http => Ok(Arc::new(ClientRouter)),
    }
}

fn connectors(server: &ServerConfig) -> ConnectorSelector {
    let opts = SocketOpts::from_tcp_config(&server.tcp);
    let tcp = Arc::new(TcpConnector::new(server.dial_timeout(), opts.clone()));
    let no_udp = Arc::new(RejectConnector::new(&format!(
        "{} does not relay udp",
        server.name
    )));

    match (server.protocol, server.network) {
        (Protocol::Socks5, _) => ConnectorSelector::new().tcp(tcp).udp(no_udp),
        (Protocol::Http, _) => ConnectorSelector::new()
            .tcp(tcp)
            .http(Arc::new(HttpConnector::new(server.dial_timeout(), opts)))
            .udp(no_udp),
        (Protocol::Forward, ListenNetwork::Tcp) => ConnectorSelector::new().tcp(tcp),
        (Protocol::Forward, ListenNetwork::Udp) => ConnectorSelector::new()
            .udp(Arc::new(UdpConnector::new(server.udp_idle_timeout()))),
    }
}
