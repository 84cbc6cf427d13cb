//! Idle-timeout behavior: the timer surfaces `connection_timeout` and the
//! protocol decides what to do with it.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;

use flywheel::{Capabilities, Protocol, Reactor, Result, TcpListener, TcpTransport};

#[derive(Default)]
struct Trace {
    timeouts: u32,
    lost: Vec<bool>,
}

struct IdleEcho {
    transport: Option<TcpTransport>,
    trace: Rc<RefCell<Trace>>,
    reactor: Reactor,
}

impl Protocol for IdleEcho {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new().with_timeout()
    }

    fn connection_made(&mut self, transport: &TcpTransport) -> Result<()> {
        transport.set_timeout(0.25);
        self.transport = Some(transport.clone());
        Ok(())
    }

    fn data_received(&mut self, data: &[u8]) -> Result<()> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        transport.write(data)?;
        // Echoing refreshes the idle deadline.
        transport.set_timeout(0.1);
        Ok(())
    }

    fn connection_timeout(&mut self) -> Result<()> {
        self.trace.borrow_mut().timeouts += 1;
        match &self.transport {
            Some(transport) => transport.close(),
            None => Ok(()),
        }
    }

    fn connection_lost(&mut self, error: Option<std::io::Error>) {
        self.trace.borrow_mut().lost.push(error.is_some());
        self.reactor.stop();
    }
}

fn idle_listener(reactor: &Reactor, trace: &Rc<RefCell<Trace>>) -> TcpListener {
    let trace = trace.clone();
    let handle = reactor.clone();
    TcpListener::new(reactor, move |reactor, socket| {
        TcpTransport::new(
            reactor,
            socket,
            Box::new(IdleEcho {
                transport: None,
                trace: trace.clone(),
                reactor: handle.clone(),
            }),
        )
    })
}

fn guard(reactor: &Reactor, seconds: f64) -> flywheel::TimerWatcher {
    let handle = reactor.clone();
    reactor
        .on_timeout(seconds, move || {
            handle.stop();
            Ok(())
        })
        .unwrap()
}

#[test]
fn test_silent_client_is_timed_out() {
    let reactor = Reactor::new();
    let trace = Rc::new(RefCell::new(Trace::default()));
    let listener = idle_listener(&reactor, &trace);
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).unwrap();
        let mut rest = Vec::new();
        // Send nothing; the server closes once the idle timer elapses.
        socket.read_to_end(&mut rest).unwrap();
        rest
    });

    let _guard = guard(&reactor, 5.0);
    reactor.start().unwrap();

    assert!(client.join().unwrap().is_empty());
    assert_eq!(trace.borrow().timeouts, 1);
    assert_eq!(trace.borrow().lost, vec![false]);
    listener.stop().unwrap();
}

#[test]
fn test_activity_refreshes_the_idle_deadline() {
    let reactor = Reactor::new();
    let trace = Rc::new(RefCell::new(Trace::default()));
    let listener = idle_listener(&reactor, &trace);
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).unwrap();
        socket.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        socket.read_exact(&mut reply).unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).unwrap();
        (reply, rest)
    });

    let _guard = guard(&reactor, 5.0);
    reactor.start().unwrap();

    let (reply, rest) = client.join().unwrap();
    assert_eq!(&reply, b"ping");
    assert!(rest.is_empty());
    assert_eq!(trace.borrow().timeouts, 1);
    assert_eq!(trace.borrow().lost, vec![false]);
    listener.stop().unwrap();
}
