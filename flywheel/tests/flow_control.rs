//! Write flow control: watermark hysteresis, flush callbacks and byte
//! conservation through a large buffered write.

use std::cell::RefCell;
use std::io::Read;
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;

use flywheel::{Capabilities, Protocol, Reactor, Result, TcpListener, TcpTransport};

const PAYLOAD: usize = 200 * 1024;
const FILL: u8 = 0x2a;

#[derive(Default)]
struct Counters {
    pauses: u32,
    resumes: u32,
    flushes: u32,
    lost: u32,
}

struct Pusher {
    counters: Rc<RefCell<Counters>>,
    reactor: Reactor,
}

impl Protocol for Pusher {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new().with_flow_control()
    }

    fn connection_made(&mut self, transport: &TcpTransport) -> Result<()> {
        transport.set_write_limit(64 * 1024)?;
        assert_eq!(transport.write_limit(), 64 * 1024);
        transport.write(&vec![FILL; PAYLOAD])?;
        let counters = self.counters.clone();
        let reactor = self.reactor.clone();
        transport.flush(move || {
            counters.borrow_mut().flushes += 1;
            reactor.stop();
            Ok(())
        })
    }

    fn data_received(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn connection_lost(&mut self, _error: Option<std::io::Error>) {
        self.counters.borrow_mut().lost += 1;
    }

    fn pause_writing(&mut self) -> Result<()> {
        self.counters.borrow_mut().pauses += 1;
        Ok(())
    }

    fn resume_writing(&mut self) -> Result<()> {
        self.counters.borrow_mut().resumes += 1;
        Ok(())
    }
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
fn test_watermark_notifications_pair_exactly_once() {
    let reactor = Reactor::new();
    let counters = Rc::new(RefCell::new(Counters::default()));
    let listener = {
        let counters = counters.clone();
        let handle = reactor.clone();
        TcpListener::new(&reactor, move |reactor, socket| {
            TcpTransport::new(
                reactor,
                socket,
                Box::new(Pusher {
                    counters: counters.clone(),
                    reactor: handle.clone(),
                }),
            )
        })
    };
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).unwrap();
        let mut received = vec![0u8; PAYLOAD];
        socket.read_exact(&mut received).unwrap();
        received.into_iter().filter(|&byte| byte == FILL).count()
    });

    let _guard = guard(&reactor, 10.0);
    reactor.start().unwrap();

    // Every byte handed to write() reached the wire.
    assert_eq!(client.join().unwrap(), PAYLOAD);
    let counters_ref = counters.borrow();
    assert_eq!(counters_ref.pauses, 1);
    assert_eq!(counters_ref.resumes, 1);
    assert_eq!(counters_ref.flushes, 1);
    drop(counters_ref);

    listener.stop().unwrap();
    assert_eq!(counters.borrow().lost, 1);
}

struct FlushNow {
    counters: Rc<RefCell<Counters>>,
    reactor: Reactor,
}

impl Protocol for FlushNow {
    fn connection_made(&mut self, transport: &TcpTransport) -> Result<()> {
        let counters = self.counters.clone();
        // Empty buffer: the callback must run immediately.
        transport.flush(move || {
            counters.borrow_mut().flushes += 1;
            Ok(())
        })?;
        assert_eq!(self.counters.borrow().flushes, 1);
        transport.close()
    }

    fn data_received(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn connection_lost(&mut self, _error: Option<std::io::Error>) {
        self.counters.borrow_mut().lost += 1;
        self.reactor.stop();
    }
}

#[test]
fn test_flush_with_empty_buffer_fires_immediately() {
    let reactor = Reactor::new();
    let counters = Rc::new(RefCell::new(Counters::default()));
    let listener = {
        let counters = counters.clone();
        let handle = reactor.clone();
        TcpListener::new(&reactor, move |reactor, socket| {
            TcpTransport::new(
                reactor,
                socket,
                Box::new(FlushNow {
                    counters: counters.clone(),
                    reactor: handle.clone(),
                }),
            )
        })
    };
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = thread::spawn(move || {
        let mut rest = Vec::new();
        TcpStream::connect(addr).unwrap().read_to_end(&mut rest).unwrap();
        rest
    });

    let _guard = guard(&reactor, 5.0);
    reactor.start().unwrap();

    assert!(client.join().unwrap().is_empty());
    assert_eq!(counters.borrow().flushes, 1);
    assert_eq!(counters.borrow().lost, 1);
    listener.stop().unwrap();
}
