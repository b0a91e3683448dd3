use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use destpool::{
    dns::{Addrs, Name, Resolve, Resolving},
    transport::{Exchanging, Opening, Transport},
};

/// A resolver whose answer the test changes as it goes.
#[derive(Clone)]
pub struct SwitchResolver {
    answer: Arc<Mutex<Vec<SocketAddr>>>,
    calls: Arc<AtomicUsize>,
}

impl SwitchResolver {
    pub fn new(addr: SocketAddr) -> SwitchResolver {
        SwitchResolver {
            answer: Arc::new(Mutex::new(vec![addr])),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn answer(&self, addr: SocketAddr) {
        *self.answer.lock().unwrap() = vec![addr];
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolve for SwitchResolver {
    fn resolve(&self, _name: Name) -> Resolving {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let addrs = self.answer.lock().unwrap().clone();
        Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) })
    }
}

/// An in-memory transport. Every exchange answers `Hello!`, after the delay
/// configured for the address the connection was opened with.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    delays: HashMap<IpAddr, Duration>,
    refused: HashSet<IpAddr>,
    broken: HashSet<IpAddr>,
    closing: HashSet<IpAddr>,
    hung_up: HashSet<usize>,
    opened: Vec<SocketAddr>,
    served: Vec<(SocketAddr, String)>,
    live: usize,
}

pub struct MockIo {
    id: usize,
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Responses from `ip` take `delay`.
    pub fn delay(self, ip: IpAddr, delay: Duration) -> MockTransport {
        self.state.lock().unwrap().delays.insert(ip, delay);
        self
    }

    /// Opening a connection to `ip` fails.
    pub fn refuse(&self, ip: IpAddr) {
        self.state.lock().unwrap().refused.insert(ip);
    }

    pub fn accept(&self, ip: IpAddr) {
        self.state.lock().unwrap().refused.remove(&ip);
    }

    /// Exchanges with `ip` fail once their delay has passed.
    pub fn break_exchanges(&self, ip: IpAddr) {
        self.state.lock().unwrap().broken.insert(ip);
    }

    /// Responses from `ip` close their connection once delivered.
    pub fn close_after_response(&self, ip: IpAddr) {
        self.state.lock().unwrap().closing.insert(ip);
    }

    /// Every connection open right now is closed by its peer.
    pub fn hang_up(&self) {
        let mut state = self.state.lock().unwrap();
        let opened = state.opened.len();
        state.hung_up.extend(0..opened);
    }

    /// Every address a connection was opened with, in order.
    pub fn opened(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().opened.clone()
    }

    /// Request paths in the order their responses were produced.
    pub fn served_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .served
            .iter()
            .map(|(_, path)| path.clone())
            .collect()
    }

    /// Connections that are open and not yet dropped.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }
}

impl Transport for MockTransport {
    type Io = MockIo;

    fn open(&self, addr: SocketAddr) -> Opening<MockIo> {
        let mut state = self.state.lock().unwrap();
        if state.refused.contains(&addr.ip()) {
            return Box::pin(async move { Err(format!("connection refused by {addr}").into()) });
        }

        let id = state.opened.len();
        state.opened.push(addr);
        state.live += 1;
        let io = MockIo {
            id,
            addr,
            state: self.state.clone(),
        };
        Box::pin(async move { Ok(io) })
    }

    fn send(&self, io: MockIo, request: http::Request<Bytes>) -> Exchanging<MockIo> {
        let (delay, broken) = {
            let state = self.state.lock().unwrap();
            (
                state.delays.get(&io.addr.ip()).copied(),
                state.broken.contains(&io.addr.ip()),
            )
        };

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if broken {
                return Err("connection reset by peer".into());
            }

            {
                let mut state = io.state.lock().unwrap();
                state.served.push((io.addr, request.uri().path().to_owned()));
                if state.closing.contains(&io.addr.ip()) {
                    state.hung_up.insert(io.id);
                }
            }
            let response = http::Response::builder()
                .header("x-served-by", io.addr.to_string())
                .body(Bytes::from_static(b"Hello!"))
                .unwrap();
            Ok((io, response))
        })
    }

    fn is_open(&self, io: &MockIo) -> bool {
        !self.state.lock().unwrap().hung_up.contains(&io.id)
    }
}

impl Drop for MockIo {
    fn drop(&mut self) {
        self.state.lock().unwrap().live -= 1;
    }
}
