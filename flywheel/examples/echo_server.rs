//! Echo server demo: `cargo run --example echo_server [addr]`.
//!
//! Echoes everything back, drops connections idle for 30 seconds, and shuts
//! down cleanly on ctrl-c.

use std::net::SocketAddr;

use flywheel::{default_reactor, Capabilities, Protocol, Result, TcpListener, TcpTransport};

const IDLE_SECONDS: f64 = 30.0;

struct Echo {
    transport: Option<TcpTransport>,
}

impl Protocol for Echo {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new().with_timeout()
    }

    fn connection_made(&mut self, transport: &TcpTransport) -> Result<()> {
        println!("+ {:?}", transport.remote_address());
        transport.set_timeout(IDLE_SECONDS);
        self.transport = Some(transport.clone());
        Ok(())
    }

    fn data_received(&mut self, data: &[u8]) -> Result<()> {
        match &self.transport {
            Some(transport) => {
                transport.set_timeout(IDLE_SECONDS);
                transport.write(data)
            }
            None => Ok(()),
        }
    }

    fn connection_timeout(&mut self) -> Result<()> {
        match &self.transport {
            Some(transport) => transport.close(),
            None => Ok(()),
        }
    }

    fn connection_lost(&mut self, error: Option<std::io::Error>) {
        match error {
            Some(error) => println!("- dropped: {error}"),
            None => println!("- closed"),
        }
    }
}

fn main() -> Result<()> {
    flywheel::dev_tracing::init_tracing();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".into())
        .parse()
        .expect("listen address");

    let reactor = default_reactor();
    let listener = TcpListener::new(&reactor, |reactor, socket| {
        TcpTransport::new(reactor, socket, Box::new(Echo { transport: None }))
    });
    let local = listener.start(addr)?;
    println!("echoing on {local}");

    {
        let listener = listener.clone();
        let handle = reactor.clone();
        reactor.on_signal(signal_hook::consts::SIGINT, move || {
            println!("shutting down");
            listener.stop()?;
            handle.stop();
            Ok(())
        })?;
    }
    reactor.start()
}
