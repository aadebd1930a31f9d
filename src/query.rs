//! The mDNS querier.
//!
//! [`query`] sends a PTR question for a service type and returns a [`ServiceStream`] yielding
//! each discovered instance as soon as its records have been reassembled; [`discover`] collects
//! the stream into a vector.

mod aggregator;

use std::{
    collections::VecDeque,
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::Error,
    hex::Hex,
    name::DomainName,
    packet::{
        self,
        decoder::MessageDecoder,
        encoder::{MessageEncoder, Question},
        records::Answer,
        Header, QType,
    },
    socket::{self, Family, SocketOptions},
    zone::trim_dots,
    MDNS_BUFFER_SIZE,
};

use aggregator::Aggregator;

/// How often reader threads check the shutdown flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound of the channel between the socket readers and the consuming stream.
const CHANNEL_BOUND: usize = 64;

/// Parameters of one service lookup.
pub struct QueryParams {
    service: String,
    domain: String,
    timeout: Duration,
    interface: Option<String>,
    want_unicast_response: bool,
    disable_ipv4: bool,
    disable_ipv6: bool,
    socket: SocketOptions,
}

impl QueryParams {
    /// Creates parameters querying for `service` (e.g. `_http._tcp`) in the `local` domain with
    /// a one second timeout.
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            domain: "local".to_string(),
            timeout: Duration::from_secs(1),
            interface: None,
            want_unicast_response: false,
            disable_ipv4: false,
            disable_ipv6: false,
            socket: SocketOptions::default(),
        }
    }

    /// Overrides the domain to browse. Defaults to `local`.
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    /// Sets how long to listen for answers. A zero timeout listens until the stream is closed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Binds the query to a specific network interface.
    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    /// Sets the unicast-response bit in the question, asking responders to reply directly.
    pub fn want_unicast_response(mut self, want: bool) -> Self {
        self.want_unicast_response = want;
        self
    }

    pub fn disable_ipv4(mut self, disable: bool) -> Self {
        self.disable_ipv4 = disable;
        self
    }

    pub fn disable_ipv6(mut self, disable: bool) -> Self {
        self.disable_ipv6 = disable;
        self
    }

    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }
}

/// One discovered service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// The instance FQDN, e.g. `Printer._http._tcp.local.`.
    pub name: String,
    /// The host FQDN the instance runs on.
    pub host: String,
    /// IPv4 addresses of the host.
    pub addrs_v4: Vec<Ipv4Addr>,
    /// IPv6 addresses of the host.
    pub addrs_v6: Vec<Ipv6Addr>,
    /// The port the instance listens on.
    pub port: u16,
    /// The first TXT entry, or the empty string.
    pub txt: String,
    /// All TXT entries.
    pub txt_fields: Vec<String>,
    pub(crate) has_txt: bool,
    pub(crate) sent: bool,
}

impl ServiceEntry {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: String::new(),
            addrs_v4: Vec::new(),
            addrs_v6: Vec::new(),
            port: 0,
            txt: String::new(),
            txt_fields: Vec::new(),
            has_txt: false,
            sent: false,
        }
    }

    /// An entry is complete once it has at least one address, a port, and a TXT record.
    pub(crate) fn is_complete(&self) -> bool {
        (!self.addrs_v4.is_empty() || !self.addrs_v6.is_empty()) && self.port != 0 && self.has_txt
    }
}

impl fmt::Display for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.name, self.host, self.port)?;
        for addr in &self.addrs_v4 {
            write!(f, " {}", addr)?;
        }
        for addr in &self.addrs_v6 {
            write!(f, " {}", addr)?;
        }
        if !self.txt_fields.is_empty() {
            write!(f, " [{}]", self.txt_fields.join(" "))?;
        }
        Ok(())
    }
}

/// Looks up instances of `service` in the `local` domain, collecting entries until `timeout`.
pub fn discover(service: &str, timeout: Duration) -> Result<Vec<ServiceEntry>, Error> {
    Ok(query(QueryParams::new(service).timeout(timeout))?.collect())
}

/// Sends a PTR query for the service named in `params` and returns the stream of discovered
/// entries.
pub fn query(params: QueryParams) -> Result<ServiceStream, Error> {
    let mut families = Vec::new();
    for family in [Family::V4, Family::V6] {
        let disabled = match family {
            Family::V4 => params.disable_ipv4,
            Family::V6 => params.disable_ipv6,
        };
        if disabled {
            continue;
        }
        match FamilySockets::open(family, &params.socket) {
            Ok(socks) => families.push(socks),
            Err(e) => log::warn!("querier: cannot use {}: {}", family, e),
        }
    }
    if families.is_empty() {
        return Err(Error::NoSocket);
    }

    if let Some(interface) = &params.interface {
        for family in &mut families {
            family.bind_interface(interface, &params.socket)?;
        }
    }

    // One PTR question for `<service>.<domain>.`, with a random id.
    let qname = format!(
        "{}.{}.",
        trim_dots(&params.service),
        trim_dots(&params.domain)
    );
    let qname = DomainName::from_str(&qname)
        .map_err(|_| Error::InvalidArgument(format!("invalid service name '{}'", qname)))?;
    let mut send_buf = [0; MDNS_BUFFER_SIZE];
    let mut header = Header::default();
    header.set_id(rand::random::<u16>());
    let mut enc = MessageEncoder::new(&mut send_buf);
    enc.set_header(header);
    enc.question(
        Question::new(&qname)
            .ty(QType::PTR)
            .unicast_response(params.want_unicast_response),
    );
    let len = enc.finish()?;
    let data = &send_buf[..len];
    log::trace!("querier: raw query: {}", Hex(data));

    let mut sent = false;
    let mut last_err = None;
    for family in &families {
        match family.unicast.send_to(data, family.family.group_addr()) {
            Ok(_) => sent = true,
            Err(e) => {
                log::warn!("querier: query send on {} failed: {}", family.family, e);
                last_err = Some(e);
            }
        }
    }
    if !sent {
        return Err(Error::Send(
            last_err.unwrap_or_else(|| io::ErrorKind::Other.into()),
        ));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = std::sync::mpsc::sync_channel(CHANNEL_BOUND);
    let mut workers = Vec::new();
    for family in families {
        for sock in [family.unicast, family.multicast] {
            sock.set_read_timeout(Some(POLL_INTERVAL))
                .map_err(Error::Bind)?;
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            workers.push(thread::spawn(move || run_reader(sock, tx, &shutdown)));
        }
    }
    drop(tx);

    let deadline = if params.timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + params.timeout)
    };
    Ok(ServiceStream {
        aggregator: Aggregator::new(&params.service, &params.domain),
        pending: VecDeque::new(),
        rx: Some(rx),
        deadline,
        shutdown,
        workers,
    })
}

/// The unicast/multicast socket pair of one address family.
struct FamilySockets {
    family: Family,
    /// Bound to an ephemeral port; sends the query and receives unicast replies.
    unicast: UdpSocket,
    /// Bound to port 5353 and joined to the group; receives multicast replies.
    multicast: UdpSocket,
}

impl FamilySockets {
    fn open(family: Family, opts: &SocketOptions) -> Result<Self, Error> {
        let unicast = socket::bind_udp(family, family.wildcard(0), opts)?;
        // If this fails, `unicast` is released before the error surfaces.
        let multicast = socket::bind_multicast(family, opts)?;
        Ok(Self {
            family,
            unicast,
            multicast,
        })
    }

    /// Points this family's sockets at the named interface: the IPv4 unicast socket is rebound
    /// to the interface address, and the multicast socket's outgoing interface is set.
    fn bind_interface(&mut self, interface: &str, opts: &SocketOptions) -> Result<(), Error> {
        if self.family == Family::V4 {
            match socket::interface_ipv4(interface) {
                Some(ip) => match socket::bind_udp(self.family, (ip, 0).into(), opts) {
                    Ok(sock) => self.unicast = sock,
                    Err(e) => {
                        log::warn!(
                            "querier: cannot bind to interface '{}' ({}), using wildcard",
                            interface,
                            e
                        );
                    }
                },
                None => log::warn!(
                    "querier: interface '{}' has no IPv4 address, using wildcard",
                    interface
                ),
            }
        }
        socket::set_outgoing_interface(&self.multicast, self.family, interface)
    }
}

fn run_reader(sock: UdpSocket, tx: SyncSender<Vec<Answer>>, shutdown: &AtomicBool) {
    let mut buf = [0; MDNS_BUFFER_SIZE];
    while !shutdown.load(Ordering::SeqCst) {
        let (len, src) = match sock.recv_from(&mut buf) {
            Ok(res) => res,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                log::warn!("querier: {}", Error::Recv(e));
                break;
            }
        };
        match collect_records(&buf[..len]) {
            Ok(records) if !records.is_empty() => {
                // The stream dropping its receiver is the signal to stop.
                if tx.send(records).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::trace!("querier: ignoring malformed packet from {}: {}", src, e);
            }
        }
    }
}

/// Extracts the owned answer and additional records from a response datagram.
///
/// Messages that are not responses, or that carry no answers and no additionals, yield an empty
/// vector. Records of unsupported types are skipped.
fn collect_records(data: &[u8]) -> Result<Vec<Answer>, packet::Error> {
    let dec = MessageDecoder::new(data)?;
    let header = dec.header();
    if !header.is_response() {
        return Ok(Vec::new());
    }
    if header.answer_count() == 0 && header.additional_count() == 0 {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut dec = dec.answers()?;
    for rr in dec.iter() {
        push_record(&rr?, &mut records);
    }
    let mut dec = dec.additional()?;
    for rr in dec.iter() {
        push_record(&rr?, &mut records);
    }
    Ok(records)
}

fn push_record(rr: &packet::decoder::ResourceRecord<'_>, records: &mut Vec<Answer>) {
    match Answer::from_rr(rr) {
        Some(Ok(answer)) => records.push(answer),
        Some(Err(e)) => log::trace!("querier: skipping undecodable record: {}", e),
        None => {}
    }
}

/// A lazy stream of [`ServiceEntry`] values.
///
/// The stream yields entries as they complete and ends when the query timeout elapses (or, with
/// a zero timeout, when the stream is closed). Closing joins the reader threads and releases
/// the sockets.
pub struct ServiceStream {
    aggregator: Aggregator,
    pending: VecDeque<ServiceEntry>,
    rx: Option<Receiver<Vec<Answer>>>,
    deadline: Option<Instant>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ServiceStream {
    /// Returns the next completed entry, or [`Error::Closed`] if the stream has been closed.
    ///
    /// `Ok(None)` means the timeout elapsed (the stream is closed afterwards).
    pub fn try_next(&mut self) -> Result<Option<ServiceEntry>, Error> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Ok(Some(entry));
            }
            let rx = self.rx.as_ref().ok_or(Error::Closed)?;

            let batch = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.close();
                        return Ok(None);
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(batch) => batch,
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                            self.close();
                            return Ok(None);
                        }
                    }
                }
                None => match rx.recv() {
                    Ok(batch) => batch,
                    Err(_) => {
                        self.close();
                        return Ok(None);
                    }
                },
            };

            for answer in &batch {
                self.aggregator.ingest(answer, &mut self.pending);
            }
        }
    }

    /// Stops the readers and releases the sockets. Idempotent.
    pub fn close(&mut self) {
        if self.rx.is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        // Dropping the receiver unblocks readers waiting on a full channel.
        self.rx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }
}

impl Iterator for ServiceStream {
    type Item = ServiceEntry;

    fn next(&mut self) -> Option<ServiceEntry> {
        self.try_next().ok().flatten()
    }
}

impl Drop for ServiceStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::responder::{encode_response, plan_response};
    use crate::zone::{HostResolver, MdnsService, ServiceBuilder};

    use super::*;

    struct FixedResolver;

    impl HostResolver for FixedResolver {
        fn hostname(&self) -> Result<String, Error> {
            Ok("testbox".to_string())
        }

        fn lookup(&self, _host: &str) -> Result<Vec<IpAddr>, Error> {
            Ok(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))])
        }
    }

    fn printer() -> MdnsService {
        ServiceBuilder::new("Printer", "_http._tcp", 80)
            .host_name("box.local.")
            .ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)))
            .txt_entry("path=/")
            .build_with(&FixedResolver)
            .unwrap()
    }

    fn query_packet(service: &str) -> Vec<u8> {
        let mut buf = [0; MDNS_BUFFER_SIZE];
        let qname = DomainName::from_str(&format!("{}.local.", service)).unwrap();
        let mut header = Header::default();
        header.set_id(7);
        let mut enc = MessageEncoder::new(&mut buf);
        enc.set_header(header);
        enc.question(Question::new(&qname).ty(QType::PTR));
        let len = enc.finish().unwrap();
        buf[..len].to_vec()
    }

    /// Runs the full wire pipeline without sockets: a query is planned against a zone, the
    /// response encoded, parsed back, and fed through the aggregator.
    #[test]
    fn responder_to_querier_pipeline() {
        let zone = printer();
        let plan = plan_response(&zone, &query_packet("_http._tcp"))
            .unwrap()
            .unwrap();
        let mut buf = [0; MDNS_BUFFER_SIZE];
        let response = encode_response(&mut buf, 0, &plan.multicast);

        let records = collect_records(response).unwrap();
        assert_eq!(records.len(), 4);

        let mut aggregator = Aggregator::new("_http._tcp", "local");
        let mut out = VecDeque::new();
        for record in &records {
            aggregator.ingest(record, &mut out);
        }

        assert_eq!(out.len(), 1);
        let entry = &out[0];
        assert_eq!(entry.name, "Printer._http._tcp.local.");
        assert_eq!(entry.host, "box.local.");
        assert_eq!(entry.addrs_v4, [Ipv4Addr::new(192, 168, 1, 2)]);
        assert_eq!(entry.port, 80);
        assert_eq!(entry.txt_fields, ["path=/"]);
    }

    #[test]
    fn non_responses_are_filtered() {
        // A query must not feed the aggregator even if it somehow carried records.
        let records = collect_records(&query_packet("_http._tcp")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn response_without_records_is_filtered() {
        let mut buf = [0; MDNS_BUFFER_SIZE];
        let response = encode_response(&mut buf, 0, &[]);
        assert!(collect_records(response).unwrap().is_empty());
    }

    #[test]
    fn malformed_datagram_is_an_error() {
        assert!(collect_records(&[0xff; 7]).is_err());
    }
}
