use crate::wait_until_listening;
use log::debug;
use mailin_embedded::{Handler, Server, SslConfig};
use std::{
    net::IpAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::{
    sync::watch::{self, error::RecvError, Receiver, Sender},
    time::timeout,
};

pub const SMTP_PORT: u16 = 4567;
pub const POISONED_SMTP_PORT: u16 = 4568;
pub const REJECTING_SMTP_PORT: u16 = 4569;
/// Nothing in the tests ever listens here.
pub const UNUSED_SMTP_PORT: u16 = 4570;

#[derive(Clone)]
struct SmtpHandler(Vec<u8>, Arc<Sender<String>>);

impl Handler for SmtpHandler {
    fn data(&mut self, buf: &[u8]) -> std::io::Result<()> {
        debug!("Got data:\n{}", String::from_utf8_lossy(buf));
        self.0.extend(buf);
        Ok(())
    }

    fn data_end(&mut self) -> mailin_embedded::Response {
        let content = String::from_utf8_lossy(&self.0).into_owned();
        self.0.clear();
        let _ = self.1.send(content);
        mailin_embedded::response::OK
    }

    fn auth_plain(
        &mut self,
        authorization_id: &str,
        authentication_id: &str,
        password: &str,
    ) -> mailin_embedded::Response {
        debug!("Got authentication data {authorization_id}, {authentication_id}, {password}");
        mailin_embedded::response::AUTH_OK
    }
}

/// An SMTP server which accepts everything and remembers the content of each message.
///
/// The server binds a fixed port and can only be started once per process, so tests share the
/// instance from [`fake_smtp`] and must run serially.
pub struct FakeSmtpServer(
    std::sync::Mutex<Option<Server<SmtpHandler>>>,
    tokio::sync::Mutex<Receiver<String>>,
);

impl FakeSmtpServer {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel("".into());
        let handler = SmtpHandler(Vec::new(), Arc::new(sender));
        Self(
            std::sync::Mutex::new(Some(smtp_server(handler, SMTP_PORT))),
            tokio::sync::Mutex::new(receiver),
        )
    }

    pub fn start(&self) {
        let mut guard = self.0.lock().unwrap();
        if let Some(server) = guard.take() {
            std::thread::spawn(move || {
                let _ = server.serve();
            });
            wait_until_listening(SMTP_PORT);
        }
    }

    /// Waits for the next message to arrive.
    pub async fn last_mail_content(&self) -> std::result::Result<String, RecvError> {
        let mut receiver = self.1.lock().await;
        receiver.changed().await?;
        let content = receiver.borrow_and_update().clone();
        drop(receiver);
        Ok(content)
    }

    /// Discards a message left over from a previous test.
    pub async fn flush(&self) {
        let mut receiver = self.1.lock().await;
        let _ = timeout(Duration::from_millis(100), receiver.changed()).await;
        let _ = receiver.borrow_and_update();
    }
}

impl Default for FakeSmtpServer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fake_smtp() -> &'static FakeSmtpServer {
    static FAKE_SMTP: OnceLock<FakeSmtpServer> = OnceLock::new();
    FAKE_SMTP.get_or_init(FakeSmtpServer::new)
}

/// Refuses the greeting, so neither verification nor sending can succeed.
#[derive(Clone)]
struct PoisonedSmtpHandler;

impl Handler for PoisonedSmtpHandler {
    fn helo(&mut self, _ip: IpAddr, _domain: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }

    fn mail(&mut self, _ip: IpAddr, _domain: &str, _from: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }
}

/// Greets normally but refuses every sender, so verification succeeds and sending fails.
#[derive(Clone)]
struct RejectingSmtpHandler;

impl Handler for RejectingSmtpHandler {
    fn mail(&mut self, _ip: IpAddr, _domain: &str, _from: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }
}

pub fn start_poisoned_smtp_server() {
    start_once(&POISONED_STARTED, PoisonedSmtpHandler, POISONED_SMTP_PORT);
}

pub fn start_rejecting_smtp_server() {
    start_once(&REJECTING_STARTED, RejectingSmtpHandler, REJECTING_SMTP_PORT);
}

static POISONED_STARTED: OnceLock<()> = OnceLock::new();
static REJECTING_STARTED: OnceLock<()> = OnceLock::new();

fn start_once<H: Handler + Clone + Send + 'static>(started: &OnceLock<()>, handler: H, port: u16) {
    started.get_or_init(|| {
        let server = smtp_server(handler, port);
        std::thread::spawn(move || {
            let _ = server.serve();
        });
        wait_until_listening(port);
    });
}

fn smtp_server<H: Handler + Clone + Send + 'static>(handler: H, port: u16) -> Server<H> {
    let mut server = Server::new(handler);
    server
        .with_name("example.com")
        .with_ssl(SslConfig::None)
        .unwrap()
        .with_addr(format!("0.0.0.0:{port}"))
        .unwrap();
    server
}
