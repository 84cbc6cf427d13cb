//! Teardown propagation: stopping the listener closes every live
//! connection, and closing the reactor reaches transports through their
//! cleanup subscriptions.

use std::cell::RefCell;
use std::io::Read;
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;

use flywheel::{Protocol, Reactor, Result, TcpListener, TcpTransport};

#[derive(Default)]
struct Trace {
    made: u32,
    lost: Vec<bool>,
}

struct Member {
    trace: Rc<RefCell<Trace>>,
    reactor: Reactor,
    // Filled in by the test once the listener exists.
    on_all_connected: Rc<RefCell<Option<Box<dyn Fn() -> Result<()>>>>>,
    expected: u32,
}

impl Protocol for Member {
    fn connection_made(&mut self, _transport: &TcpTransport) -> Result<()> {
        let made = {
            let mut trace = self.trace.borrow_mut();
            trace.made += 1;
            trace.made
        };
        if made == self.expected {
            if let Some(hook) = self.on_all_connected.borrow().as_ref() {
                hook()?;
            }
        }
        Ok(())
    }

    fn data_received(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn connection_lost(&mut self, error: Option<std::io::Error>) {
        let mut trace = self.trace.borrow_mut();
        trace.lost.push(error.is_some());
        if trace.lost.len() as u32 == self.expected {
            self.reactor.stop();
        }
    }
}

#[allow(clippy::type_complexity)]
fn member_listener(
    reactor: &Reactor,
    trace: &Rc<RefCell<Trace>>,
    hook: &Rc<RefCell<Option<Box<dyn Fn() -> Result<()>>>>>,
    expected: u32,
) -> TcpListener {
    let trace = trace.clone();
    let hook = hook.clone();
    let handle = reactor.clone();
    TcpListener::new(reactor, move |reactor, socket| {
        TcpTransport::new(
            reactor,
            socket,
            Box::new(Member {
                trace: trace.clone(),
                reactor: handle.clone(),
                on_all_connected: hook.clone(),
                expected,
            }),
        )
    })
}

fn spawn_reader(addr: std::net::SocketAddr) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut rest = Vec::new();
        TcpStream::connect(addr)
            .unwrap()
            .read_to_end(&mut rest)
            .unwrap();
        rest
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
fn test_listener_stop_closes_every_connection() {
    let reactor = Reactor::new();
    let trace = Rc::new(RefCell::new(Trace::default()));
    let hook: Rc<RefCell<Option<Box<dyn Fn() -> Result<()>>>>> = Rc::new(RefCell::new(None));
    let listener = member_listener(&reactor, &trace, &hook, 3);
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    // Once all three are connected, stop the listener from a deferred call.
    {
        let listener = listener.clone();
        let reactor_handle = reactor.clone();
        *hook.borrow_mut() = Some(Box::new(move || {
            let listener = listener.clone();
            reactor_handle.call(move || listener.stop())
        }));
    }

    let clients: Vec<_> = (0..3).map(|_| spawn_reader(addr)).collect();

    let _guard = guard(&reactor, 5.0);
    reactor.start().unwrap();

    for client in clients {
        assert!(client.join().unwrap().is_empty());
    }
    assert_eq!(trace.borrow().made, 3);
    assert_eq!(trace.borrow().lost, vec![false, false, false]);
    assert_eq!(listener.connection_count(), 0);
    // stop() is idempotent.
    listener.stop().unwrap();
}

#[test]
fn test_reactor_close_aborts_live_transports() {
    let reactor = Reactor::new();
    let trace = Rc::new(RefCell::new(Trace::default()));
    let hook: Rc<RefCell<Option<Box<dyn Fn() -> Result<()>>>>> = Rc::new(RefCell::new(None));
    let listener = member_listener(&reactor, &trace, &hook, 2);
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    // Stop dispatch once both connections are up; teardown happens below.
    {
        let reactor_handle = reactor.clone();
        *hook.borrow_mut() = Some(Box::new(move || {
            reactor_handle.stop();
            Ok(())
        }));
    }

    let clients: Vec<_> = (0..2).map(|_| spawn_reader(addr)).collect();

    let _guard = guard(&reactor, 5.0);
    reactor.start().unwrap();
    assert_eq!(trace.borrow().made, 2);
    assert_eq!(listener.connection_count(), 2);

    // CLEANUP must reach both transports and the listener.
    reactor.close();

    for client in clients {
        assert!(client.join().unwrap().is_empty());
    }
    assert_eq!(trace.borrow().lost, vec![false, false]);
    assert_eq!(listener.connection_count(), 0);
    assert!(reactor.is_closed());
}
