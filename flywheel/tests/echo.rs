//! Echo round-trip over a real socket (client on its own thread).

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;

use flywheel::{Protocol, Reactor, Result, TcpListener, TcpTransport};

#[derive(Default)]
struct Trace {
    // One entry per connection_lost; true when it carried an error.
    lost: Vec<bool>,
}

struct Echo {
    transport: Option<TcpTransport>,
    trace: Rc<RefCell<Trace>>,
    reactor: Reactor,
}

impl Protocol for Echo {
    fn connection_made(&mut self, transport: &TcpTransport) -> Result<()> {
        assert!(transport.remote_address().is_some());
        self.transport = Some(transport.clone());
        Ok(())
    }

    fn data_received(&mut self, data: &[u8]) -> Result<()> {
        match &self.transport {
            Some(transport) => transport.write(data),
            None => Ok(()),
        }
    }

    fn connection_lost(&mut self, error: Option<std::io::Error>) {
        self.trace.borrow_mut().lost.push(error.is_some());
        self.reactor.stop();
    }
}

fn echo_listener(reactor: &Reactor, trace: &Rc<RefCell<Trace>>) -> TcpListener {
    let trace = trace.clone();
    let handle = reactor.clone();
    TcpListener::new(reactor, move |reactor, socket| {
        TcpTransport::new(
            reactor,
            socket,
            Box::new(Echo {
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
fn test_echo_round_trip_and_clean_close() {
    flywheel::dev_tracing::init_tracing();
    let reactor = Reactor::new();
    let trace = Rc::new(RefCell::new(Trace::default()));
    let listener = echo_listener(&reactor, &trace);
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).unwrap();
        socket.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        socket.read_exact(&mut reply).unwrap();
        reply
    });

    let _guard = guard(&reactor, 5.0);
    reactor.start().unwrap();

    assert_eq!(&client.join().unwrap(), b"hello");
    assert_eq!(trace.borrow().lost, vec![false]);
    assert_eq!(listener.connection_count(), 0);
    listener.stop().unwrap();
}

#[test]
fn test_echo_handles_consecutive_connections() {
    let reactor = Reactor::new();
    let trace = Rc::new(RefCell::new(Trace::default()));
    let listener = echo_listener(&reactor, &trace);
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    for round in 0u8..3 {
        let client = thread::spawn(move || {
            let mut socket = TcpStream::connect(addr).unwrap();
            socket.write_all(&[round; 4]).unwrap();
            let mut reply = [0u8; 4];
            socket.read_exact(&mut reply).unwrap();
            reply
        });
        let _guard = guard(&reactor, 5.0);
        reactor.start().unwrap();
        assert_eq!(client.join().unwrap(), [round; 4]);
    }
    assert_eq!(trace.borrow().lost, vec![false, false, false]);
    listener.stop().unwrap();
}
