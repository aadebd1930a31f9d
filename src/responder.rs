//! The mDNS responder engine.
//!
//! The responder listens on port 5353 in both address families, filters incoming queries, asks
//! its [`Zone`] for answers, and sends responses back: multicast by default, unicast when the
//! question requests it.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    error::Error,
    packet::{
        self, decoder::MessageDecoder, encoder::MessageEncoder, records::Answer, Header, Opcode,
        RCode,
    },
    socket::{self, Family, SocketOptions},
    zone::Zone,
    MDNS_BUFFER_SIZE,
};

/// How often reader threads check the shutdown flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Responder configuration.
#[derive(Default)]
pub struct ResponderConfig {
    /// Route outgoing multicast responses through this interface instead of the OS default.
    pub interface: Option<String>,
    /// Log queries that matched the zone but produced no records.
    pub log_empty_responses: bool,
    /// Do not listen on IPv4.
    pub disable_ipv4: bool,
    /// Do not listen on IPv6.
    pub disable_ipv6: bool,
    pub socket: SocketOptions,
}

/// An mDNS responder serving one [`Zone`].
pub struct Responder {
    zone: Arc<dyn Zone + Send + Sync>,
    config: ResponderConfig,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    running: bool,
}

impl Responder {
    pub fn new(zone: impl Zone + Send + Sync + 'static, config: ResponderConfig) -> Self {
        Self {
            zone: Arc::new(zone),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            running: false,
        }
    }

    /// Binds the mDNS sockets and starts answering queries.
    ///
    /// Each address family is attempted independently; a family that cannot be set up is logged
    /// and skipped. Fails with [`Error::NoSocket`] if no family could be set up, and with
    /// [`Error::AlreadyRunning`] if the responder is already started.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }

        let mut socks = Vec::new();
        for family in [Family::V4, Family::V6] {
            let disabled = match family {
                Family::V4 => self.config.disable_ipv4,
                Family::V6 => self.config.disable_ipv6,
            };
            if disabled {
                continue;
            }
            match self.open(family) {
                Ok(sock) => socks.push((family, sock)),
                Err(e) => log::warn!("responder: cannot listen on {}: {}", family, e),
            }
        }
        if socks.is_empty() {
            return Err(Error::NoSocket);
        }

        self.shutdown = Arc::new(AtomicBool::new(false));
        for (family, sock) in socks {
            let zone = self.zone.clone();
            let shutdown = self.shutdown.clone();
            let log_empty = self.config.log_empty_responses;
            self.workers.push(thread::spawn(move || {
                run_reader(sock, family, &*zone, &shutdown, log_empty)
            }));
        }
        self.running = true;
        Ok(())
    }

    fn open(&self, family: Family) -> Result<UdpSocket, Error> {
        let sock = socket::bind_multicast(family, &self.config.socket)?;
        if let Some(interface) = &self.config.interface {
            socket::set_outgoing_interface(&sock, family, interface)?;
        }
        sock.set_read_timeout(Some(POLL_INTERVAL))
            .map_err(Error::Bind)?;
        Ok(sock)
    }

    /// Stops the responder and closes its sockets. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(
    sock: UdpSocket,
    family: Family,
    zone: &dyn Zone,
    shutdown: &AtomicBool,
    log_empty: bool,
) {
    let mut buf = [0; MDNS_BUFFER_SIZE];
    while !shutdown.load(Ordering::SeqCst) {
        let (len, src) = match sock.recv_from(&mut buf) {
            Ok(res) => res,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                log::warn!("responder: {}", Error::Recv(e));
                break;
            }
        };
        handle_packet(&sock, family, zone, &buf[..len], src, log_empty);
    }
}

fn handle_packet(
    sock: &UdpSocket,
    family: Family,
    zone: &dyn Zone,
    packet: &[u8],
    src: SocketAddr,
    log_empty: bool,
) {
    let plan = match plan_response(zone, packet) {
        Ok(Some(plan)) => plan,
        Ok(None) => return,
        Err(e) => {
            log::trace!("responder: ignoring malformed packet from {}: {}", src, e);
            return;
        }
    };

    if plan.multicast.is_empty() && plan.unicast.is_empty() {
        if log_empty {
            log::debug!("responder: no records for query from {}", src);
        }
        return;
    }

    let mut out = [0; MDNS_BUFFER_SIZE];
    if !plan.multicast.is_empty() {
        let data = encode_response(&mut out, 0, &plan.multicast);
        if let Err(e) = sock.send_to(data, family.group_addr()) {
            log::warn!("responder: {}", Error::Send(e));
        }
    }
    if !plan.unicast.is_empty() {
        let data = encode_response(&mut out, plan.query_id, &plan.unicast);
        if let Err(e) = sock.send_to(data, src) {
            log::warn!("responder: {}", Error::Send(e));
        }
    }
}

/// The answers a query produced, split by requested delivery.
pub(crate) struct ResponsePlan {
    pub(crate) query_id: u16,
    pub(crate) multicast: Vec<Answer>,
    pub(crate) unicast: Vec<Answer>,
}

/// Parses a datagram and collects the zone's answers for it.
///
/// Returns `Ok(None)` for messages the responder must stay silent on: responses, non-QUERY
/// opcodes, and error rcodes.
pub(crate) fn plan_response(
    zone: &dyn Zone,
    packet: &[u8],
) -> Result<Option<ResponsePlan>, packet::Error> {
    let mut dec = MessageDecoder::new(packet)?;
    let header = dec.header();
    if header.is_response()
        || header.opcode() != Opcode::QUERY
        || header.rcode() != RCode::NO_ERROR
    {
        return Ok(None);
    }

    let mut plan = ResponsePlan {
        query_id: header.id(),
        multicast: Vec::new(),
        unicast: Vec::new(),
    };
    for question in dec.iter() {
        let question = question?;
        log::debug!("responder: Q: {}", question);

        let records = zone.records(question.qname(), question.qtype());
        if records.is_empty() {
            continue;
        }
        if question.unicast_response() {
            plan.unicast.extend(records);
        } else {
            plan.multicast.extend(records);
        }
    }
    Ok(Some(plan))
}

/// Encodes an authoritative response carrying `answers`, with an empty question section.
pub(crate) fn encode_response<'a>(buf: &'a mut [u8], id: u16, answers: &[Answer]) -> &'a [u8] {
    let cap = buf.len();
    let mut header = Header::default();
    header.set_id(id);
    header.set_response(true);
    header.set_authority(true);

    let mut enc = MessageEncoder::new(buf);
    enc.set_header(header);
    let mut enc = enc.answers();
    for answer in answers {
        enc.add_answer(answer);
    }
    // Truncated replies still get sent.
    let len = enc.finish().ok().unwrap_or(cap);
    &buf[..len]
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use crate::name::DomainName;
    use crate::packet::encoder::Question;
    use crate::packet::QType;
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

    fn query(id: u16, name: &str, qtype: QType, unicast: bool) -> Vec<u8> {
        let mut buf = [0; MDNS_BUFFER_SIZE];
        let mut header = Header::default();
        header.set_id(id);
        let mut enc = MessageEncoder::new(&mut buf);
        enc.set_header(header);
        let name = DomainName::from_str(name).unwrap();
        enc.question(Question::new(&name).ty(qtype).unicast_response(unicast));
        let len = enc.finish().unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn multicast_question_goes_to_multicast_bucket() {
        let zone = printer();
        let packet = query(42, "_http._tcp.local.", QType::PTR, false);
        let plan = plan_response(&zone, &packet).unwrap().unwrap();
        assert!(plan.unicast.is_empty());
        assert_eq!(plan.multicast.len(), 4);

        // Multicast responses carry id 0 and the QR|AA flag word.
        let mut out = [0; MDNS_BUFFER_SIZE];
        let data = encode_response(&mut out, 0, &plan.multicast);
        assert_eq!(&data[..4], &[0x00, 0x00, 0x84, 0x00]);
        // qdcount 0, ancount 4.
        assert_eq!(&data[4..8], &[0x00, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn unicast_question_echoes_query_id() {
        let zone = printer();
        let packet = query(0x1234, "_http._tcp.local.", QType::PTR, true);
        let plan = plan_response(&zone, &packet).unwrap().unwrap();
        assert!(plan.multicast.is_empty());
        assert_eq!(plan.unicast.len(), 4);

        let mut out = [0; MDNS_BUFFER_SIZE];
        let data = encode_response(&mut out, plan.query_id, &plan.unicast);
        assert_eq!(&data[..4], &[0x12, 0x34, 0x84, 0x00]);
    }

    #[test]
    fn responses_and_errors_are_ignored() {
        let zone = printer();

        // A response message must not be answered.
        let mut packet = query(42, "_http._tcp.local.", QType::PTR, false);
        packet[2] |= 0x80; // set QR
        assert!(plan_response(&zone, &packet).unwrap().is_none());

        // Non-QUERY opcode.
        let mut packet = query(42, "_http._tcp.local.", QType::PTR, false);
        packet[2] |= 0x28; // opcode 5 (UPDATE)
        assert!(plan_response(&zone, &packet).unwrap().is_none());

        // Non-zero rcode.
        let mut packet = query(42, "_http._tcp.local.", QType::PTR, false);
        packet[3] |= 0x03; // NX_DOMAIN
        assert!(plan_response(&zone, &packet).unwrap().is_none());

        // Garbage fails to parse.
        assert!(plan_response(&zone, &[0xff; 5]).is_err());
    }

    #[test]
    fn unanswerable_question_yields_empty_plan() {
        let zone = printer();
        let packet = query(42, "unknown.local.", QType::A, false);
        let plan = plan_response(&zone, &packet).unwrap().unwrap();
        assert!(plan.multicast.is_empty());
        assert!(plan.unicast.is_empty());
    }

    #[test]
    fn lifecycle() {
        let mut responder = Responder::new(printer(), ResponderConfig::default());
        assert!(!responder.is_running());
        responder.stop(); // idempotent before start
        assert!(!responder.is_running());
    }
}
