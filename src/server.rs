//! The signaling engine: listeners, dispatch, transactions and routes.
use crate::{
    config::ServerConfig,
    manscdp,
    message::{make_response, Address, Parser, Request, Response, SipMessage},
    observer::Observer,
    router::{route_key, Context, HandlerRef, RouteGroup, Router},
    transaction::{make_via_branch, Transaction, TransactionKey, Transactions},
    transport::{SipConnection, TcpConnection, TcpListenerConnection, UdpConnection},
    Error, Result,
};
use rsip::{
    param::OtherParam,
    prelude::{HeadersExt, ToTypedHeader},
    Method, Param, StatusCode,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tokio::{
    select,
    sync::{mpsc, Semaphore, TryAcquireError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub struct ServerBuilder {
    config: ServerConfig,
    identity: Option<Address>,
    cancel_token: Option<CancellationToken>,
    transaction_ttl: Option<Duration>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            config: ServerConfig::default(),
            identity: None,
            cancel_token: None,
            transaction_ttl: None,
        }
    }

    pub fn with_config(&mut self, config: ServerConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn with_identity(&mut self, identity: Address) -> &mut Self {
        self.identity.replace(identity);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_transaction_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.transaction_ttl.replace(ttl);
        self
    }

    pub fn with_host(&mut self, host: IpAddr) -> &mut Self {
        self.config.host = Some(host);
        self
    }

    /// Fails when the configured identity is not a valid address.
    pub fn build(&mut self) -> Result<Server> {
        let identity = match self.identity.take() {
            Some(identity) => identity,
            None => self
                .config
                .identity
                .parse::<Address>()
                .map_err(|e| Error::ConfigError(format!("identity: {}", e)))?,
        };
        let ttl = self
            .transaction_ttl
            .take()
            .unwrap_or_else(|| self.config.transaction_ttl());
        let permits = self.config.max_concurrent_handlers.max(1);

        Ok(Server {
            inner: Arc::new(ServerInner {
                config: self.config.clone(),
                identity,
                host: RwLock::new(self.config.host),
                udp: RwLock::new(None),
                tcp: RwLock::new(None),
                transactions: Transactions::new(ttl),
                router: Router::new(),
                observer: Observer::new(),
                cancel_token: self.cancel_token.take().unwrap_or_default(),
                handler_permits: Arc::new(Semaphore::new(permits)),
                sweepers_started: AtomicBool::new(false),
            }),
        })
    }
}

pub struct ServerInner {
    config: ServerConfig,
    identity: Address,
    host: RwLock<Option<IpAddr>>,
    udp: RwLock<Option<UdpConnection>>,
    tcp: RwLock<Option<TcpListenerConnection>>,
    transactions: Transactions,
    router: Router,
    observer: Observer,
    cancel_token: CancellationToken,
    handler_permits: Arc<Semaphore>,
    sweepers_started: AtomicBool,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// First non-loopback IPv4 address of this host.
fn self_ip() -> Option<IpAddr> {
    get_if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .find(|iface| !iface.is_loopback() && iface.ip().is_ipv4())
        .map(|iface| iface.ip())
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &Address {
        &self.inner.identity
    }

    /// Host written into the Via of requests this server issues.
    pub fn host(&self) -> IpAddr {
        if let Some(host) = *self.inner.host.read().unwrap_or_else(|e| e.into_inner()) {
            return host;
        }
        self_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn transactions(&self) -> &Transactions {
        &self.inner.transactions
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn observer(&self) -> &Observer {
        &self.inner.observer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    pub fn udp_connection(&self) -> Option<UdpConnection> {
        self.inner
            .udp
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn tcp_listener(&self) -> Option<TcpListenerConnection> {
        self.inner
            .tcp
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp_connection().map(|c| c.get_addr().addr)
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_listener().map(|l| l.get_addr().addr)
    }

    pub fn register(&self, handlers: Vec<HandlerRef>) {
        self.inner.router.add(Method::Register.to_string().as_str(), handlers);
    }

    pub fn message(&self, handlers: Vec<HandlerRef>) -> RouteGroup<'_> {
        self.inner
            .router
            .group(Method::Message.to_string().as_str(), handlers)
    }

    pub fn notify(&self, handlers: Vec<HandlerRef>) -> RouteGroup<'_> {
        self.inner
            .router
            .group(Method::Notify.to_string().as_str(), handlers)
    }

    /// Registers a chain for any other method, e.g. INVITE or BYE.
    pub fn route(&self, method: &str, handlers: Vec<HandlerRef>) {
        self.inner.router.add(method, handlers);
    }

    fn resolve_host(&self, bound: IpAddr) {
        let mut host = self.inner.host.write().unwrap_or_else(|e| e.into_inner());
        if host.is_some() {
            return;
        }
        let resolved = if bound.is_unspecified() {
            self_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            bound
        };
        info!("resolved local host {}", resolved);
        host.replace(resolved);
    }

    fn start_sweepers(&self) {
        if self.inner.sweepers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval = self.inner.config.sweep_interval();
        let server = self.clone();
        tokio::spawn(async move {
            let token = server.inner.cancel_token.child_token();
            server.inner.transactions.serve(token, interval).await;
        });
        let server = self.clone();
        tokio::spawn(async move {
            let token = server.inner.cancel_token.child_token();
            server.inner.observer.run(token, interval).await;
        });
    }

    /// Binds the shared UDP socket and returns its local address.
    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let conn = UdpConnection::create_connection(addr).await?;
        let local = conn.get_addr().addr;
        self.resolve_host(local.ip());
        self.inner
            .udp
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(conn);
        info!("listening on udp {}", local);
        Ok(local)
    }

    /// Reads the bound UDP socket until the server is closed.
    pub async fn serve_udp(&self) -> Result<()> {
        let conn = self.udp_connection().ok_or_else(|| {
            Error::Error("serve_udp: no udp socket bound".to_string())
        })?;
        self.start_sweepers();
        let (packets, messages) = Parser::spawn(self.inner.config.parser_queue_capacity.max(1));
        tokio::spawn(self.clone().dispatch(messages));
        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("udp server stopped: {}", conn.get_addr());
                Ok(())
            }
            r = conn.serve_loop(packets) => {
                if let Err(e) = &r {
                    error!("udp read loop failed: {}", e);
                }
                r
            }
        }
    }

    pub async fn listen_udp(&self, addr: SocketAddr) -> Result<()> {
        self.bind_udp(addr).await?;
        self.serve_udp().await
    }

    /// Binds the TCP listener and returns its local address.
    pub async fn bind_tcp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListenerConnection::bind(addr).await?;
        let local = listener.get_addr().addr;
        self.resolve_host(local.ip());
        self.inner
            .tcp
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(listener);
        info!("listening on tcp {}", local);
        Ok(local)
    }

    /// Accepts TCP peers until the server is closed. Every peer gets its
    /// own read loop, parser and dispatcher.
    pub async fn serve_tcp(&self) -> Result<()> {
        let listener = self.tcp_listener().ok_or_else(|| {
            Error::Error("serve_tcp: no tcp listener bound".to_string())
        })?;
        self.start_sweepers();
        loop {
            let accepted = select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("tcp server stopped: {}", listener.get_addr());
                    return Ok(());
                }
                r = listener.accept() => r,
            };
            match accepted {
                Ok(conn) => self.serve_tcp_connection(conn),
                Err(e) => {
                    if self.inner.cancel_token.is_cancelled() {
                        return Ok(());
                    }
                    error!("tcp accept failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<()> {
        self.bind_tcp(addr).await?;
        self.serve_tcp().await
    }

    fn serve_tcp_connection(&self, conn: TcpConnection) {
        let (packets, messages) = Parser::spawn(self.inner.config.parser_queue_capacity.max(1));
        tokio::spawn(self.clone().dispatch(messages));
        tokio::spawn(async move {
            if let Err(e) = conn.serve_loop(packets).await {
                warn!("tcp read loop failed: {}", e);
            }
            conn.close().await.ok();
            debug!("tcp connection done: {}", conn);
        });
    }

    /// Binds and serves the listeners named in the configuration.
    pub async fn serve(&self) -> Result<()> {
        let udp_addr = self.inner.config.udp_addr;
        let tcp_addr = self.inner.config.tcp_addr;
        if let Some(addr) = udp_addr {
            self.bind_udp(addr).await?;
        }
        if let Some(addr) = tcp_addr {
            self.bind_tcp(addr).await?;
        }
        match (udp_addr, tcp_addr) {
            (Some(_), Some(_)) => tokio::try_join!(self.serve_udp(), self.serve_tcp()).map(|_| ()),
            (Some(_), None) => self.serve_udp().await,
            (None, Some(_)) => self.serve_tcp().await,
            (None, None) => Err(Error::ConfigError(
                "no listen address configured".to_string(),
            )),
        }
    }

    /// Cancels the lifecycle, drops pending transactions and observers and
    /// closes both transports. Safe to call twice.
    pub fn close(&self) {
        self.inner.cancel_token.cancel();
        let dropped = self.inner.transactions.clear();
        self.inner.observer.clear();
        debug!(dropped, "transactions dropped on close");
        if let Some(udp) = self
            .inner
            .udp
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            udp.close();
            info!("udp closed: {}", udp.get_addr());
        }
        if let Some(tcp) = self
            .inner
            .tcp
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tcp.close();
            info!("tcp closed: {}", tcp.get_addr());
        }
    }

    /// Connection replies for `req` leave through: its own TCP peer, or
    /// the shared UDP socket.
    fn reply_connection(&self, req: &Request) -> Result<SipConnection> {
        match &req.connection {
            Some(conn @ SipConnection::Tcp(_)) => Ok(conn.clone()),
            _ => self
                .udp_connection()
                .map(SipConnection::Udp)
                .ok_or_else(|| Error::Error("no udp socket bound".to_string())),
        }
    }

    /// Issues a request from this server.
    ///
    /// The top Via is stamped with the local host and listening port, a
    /// branch when it has none and `rport`. The returned transaction
    /// receives the correlated responses.
    pub async fn request(&self, mut req: Request) -> Result<Arc<Transaction>> {
        let connection = self.reply_connection(&req)?;
        let sent_by = SocketAddr::new(self.host(), connection.get_addr().addr.port());

        let via = req
            .inner
            .via_header_mut()
            .map_err(|_| Error::Error("missing required 'Via' header".to_string()))?;
        let mut typed = via.typed()?;
        typed.uri.host_with_port = sent_by.into();
        if !typed.params.iter().any(|p| matches!(p, Param::Branch(_))) {
            typed.params.push(make_via_branch());
        }
        let has_rport = typed.params.iter().any(|p| {
            matches!(p, Param::Other(key, _) if key.to_string().eq_ignore_ascii_case("rport"))
        });
        if !has_rport {
            typed.params.push(Param::Other(OtherParam::new("rport"), None));
        }
        *via = typed.into();

        if req.destination.is_none() {
            req.destination = req.inner.uri.host_with_port.clone().try_into().ok();
        }
        req.connection = Some(connection.clone());

        let key = TransactionKey::try_from(&req.inner)?;
        let tx = self
            .inner
            .transactions
            .must_get(&key, &connection, Some(&req));
        tx.request(req).await?;
        Ok(tx)
    }

    /// Never waits on handlers, so a response is always delivered even when
    /// every handler is blocked on one.
    async fn dispatch(self, mut messages: mpsc::Receiver<SipMessage>) {
        while let Some(msg) = messages.recv().await {
            match msg {
                SipMessage::Request(req) => self.handle_request(req),
                SipMessage::Response(resp) => self.handle_response(resp),
            }
        }
    }

    fn reply_status(tx: Arc<Transaction>, req: &Request, status: StatusCode) {
        let resp = make_response(req, status.clone(), None, None);
        tokio::spawn(async move {
            if let Err(e) = tx.respond(resp).await {
                warn!("respond {} failed: {}", status, e);
            }
        });
    }

    fn handle_request(&self, req: Request) {
        let key = match TransactionKey::try_from(&req.inner) {
            Ok(key) => key,
            Err(e) => {
                warn!(source = ?req.source, "request without transaction key: {}", e);
                return;
            }
        };
        let connection = match self.reply_connection(&req) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("no reply path for {}: {}", key, e);
                return;
            }
        };
        let tx = self
            .inner
            .transactions
            .must_get(&key, &connection, Some(&req));

        let method = req.inner.method.to_string();
        let route = match req.inner.method {
            Method::Message | Method::Notify => {
                if req.inner.body.is_empty() {
                    warn!(source = ?req.source, "{} without body", method);
                    return;
                }
                match manscdp::decode(&req.inner.body) {
                    Ok(cmd) => route_key(&method, Some(&cmd.cmd_type)),
                    Err(e) => {
                        warn!(source = ?req.source, "{} body: {}", method, e);
                        return;
                    }
                }
            }
            _ => route_key(&method, None),
        };

        let handlers = match self.inner.router.get(&route) {
            Some(handlers) => handlers,
            None if req.inner.method == Method::Ack => {
                debug!("unrouted ACK {}", key);
                return;
            }
            None => {
                warn!(route = %route, source = ?req.source, "no handler, method not allowed");
                Self::reply_status(tx, &req, StatusCode::MethodNotAllowed);
                return;
            }
        };

        let permit = match self.inner.handler_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                warn!(route = %route, source = ?req.source, "handlers saturated");
                if req.inner.method != Method::Ack {
                    Self::reply_status(tx, &req, StatusCode::ServiceUnavailable);
                }
                return;
            }
            Err(TryAcquireError::Closed) => return,
        };
        let mut ctx = match Context::new(req, tx, handlers, self.clone()) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(route = %route, "dropping request: {}", e);
                return;
            }
        };
        let span = ctx.span().clone();
        tokio::spawn(
            async move {
                ctx.next().await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    fn handle_response(&self, resp: Response) {
        let key = match TransactionKey::try_from(&resp.inner) {
            Ok(key) => key,
            Err(e) => {
                warn!(source = ?resp.source, "response without transaction key: {}", e);
                return;
            }
        };
        match self.inner.transactions.get(&key) {
            Some(tx) => tx.receive(resp),
            None => debug!(source = ?resp.source, "no transaction for response {}", key),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("identity", &self.inner.identity.to_string())
            .field("udp", &self.local_udp_addr())
            .field("tcp", &self.local_tcp_addr())
            .finish()
    }
}
