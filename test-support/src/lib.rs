use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::{
    net::TcpStream,
    thread::sleep,
    time::{Duration, Instant},
};

pub mod fake_resend;
pub mod fake_smtp;

/// Routes `log` records (and `tracing` events, through its `log` feature) to the terminal.
pub fn setup_logging() {
    let _ = TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}

/// Blocks until something accepts connections on the given local port, or a second has passed.
pub fn wait_until_listening(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while TcpStream::connect(("127.0.0.1", port)).is_err() && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }
}
