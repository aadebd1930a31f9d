//! Authoritative zones for mDNS service advertisement.
//!
//! A [`MdnsService`] describes one advertised service instance and synthesizes the answer set
//! for an incoming question. Multiple services are combined with a [`CompositeZone`].

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs},
};

use crate::{
    error::Error,
    name::{DomainName, Label},
    packet::{
        records::{Answer, Record, A, AAAA, PTR, SRV, TXT},
        QType,
    },
};

/// TTL of all records served by a zone, in seconds.
pub const DEFAULT_TTL: u32 = 120;

const SRV_PRIORITY: u16 = 10;
const SRV_WEIGHT: u16 = 1;

/// The name under which DNS-SD enumerates the available service types.
const TYPE_ENUMERATION_NAME: &str = "_services._dns-sd._udp";

/// Maps a question onto the records that answer it.
///
/// Implementations must return an empty vector for names and types they are not authoritative
/// for; the responder stays silent in that case.
pub trait Zone {
    fn records(&self, name: &DomainName, qtype: QType) -> Vec<Answer>;
}

/// Resolves the pieces of a service definition that were not supplied explicitly.
///
/// [`ServiceBuilder::build`] uses the [`SystemResolver`]; tests inject a fixed implementation so
/// that zone construction never touches the OS.
pub trait HostResolver {
    /// Returns the machine's host name, without a domain suffix.
    fn hostname(&self) -> Result<String, Error>;

    /// Resolves a host FQDN to its addresses.
    fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
}

/// The default [`HostResolver`], backed by the OS.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn hostname(&self) -> Result<String, Error> {
        let name = hostname::get()
            .map_err(|e| Error::InvalidArgument(format!("cannot determine host name: {}", e)))?;
        name.into_string()
            .map_err(|_| Error::InvalidArgument("host name is not valid UTF-8".into()))
    }

    fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        // The port is irrelevant; `ToSocketAddrs` requires one.
        let addrs = (trim_dots(host), 0)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidArgument(format!("cannot resolve host '{}': {}", host, e)))?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Builds a [`MdnsService`] from its parts, filling in defaults from a [`HostResolver`].
pub struct ServiceBuilder {
    instance: String,
    service: String,
    domain: String,
    host_name: Option<String>,
    port: u16,
    ips: Vec<IpAddr>,
    txt: Vec<String>,
}

impl ServiceBuilder {
    /// Creates a builder for an instance of `service` (e.g. `_http._tcp`) reachable on `port`.
    ///
    /// `instance` is a free-form single label, typically a human-readable name.
    pub fn new(instance: &str, service: &str, port: u16) -> Self {
        Self {
            instance: instance.to_string(),
            service: service.to_string(),
            domain: "local.".to_string(),
            host_name: None,
            port,
            ips: Vec::new(),
            txt: Vec::new(),
        }
    }

    /// Overrides the domain to advertise in. Defaults to `local.`.
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    /// Overrides the host FQDN the service runs on.
    ///
    /// Defaults to the OS host name suffixed with the domain.
    pub fn host_name(mut self, host_name: &str) -> Self {
        self.host_name = Some(host_name.to_string());
        self
    }

    /// Adds an address the host is reachable under.
    ///
    /// If no addresses are added, the host name is resolved instead.
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ips.push(ip);
        self
    }

    /// Adds several addresses the host is reachable under.
    pub fn ips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.ips.extend(ips);
        self
    }

    /// Adds one TXT entry, conventionally of the form `key=value`.
    pub fn txt_entry(mut self, entry: &str) -> Self {
        self.txt.push(entry.to_string());
        self
    }

    /// Replaces the TXT entries.
    pub fn txt(mut self, entries: impl IntoIterator<Item = String>) -> Self {
        self.txt = entries.into_iter().collect();
        self
    }

    /// Validates the definition and constructs the service zone, using the OS to fill in a
    /// missing host name or address list.
    pub fn build(self) -> Result<MdnsService, Error> {
        self.build_with(&SystemResolver)
    }

    /// Like [`ServiceBuilder::build`], with an explicit [`HostResolver`].
    pub fn build_with(self, resolver: &dyn HostResolver) -> Result<MdnsService, Error> {
        if self.instance.is_empty() {
            return Err(Error::InvalidArgument("instance name is empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidArgument("port must be non-zero".into()));
        }
        validate_fqdn(&self.domain, "domain")?;

        let host_name = match &self.host_name {
            Some(h) => h.clone(),
            None => format!("{}.{}.", resolver.hostname()?, trim_dots(&self.domain)),
        };
        validate_fqdn(&host_name, "host name")?;

        let ips = if self.ips.is_empty() {
            resolver.lookup(&host_name)?
        } else {
            self.ips
        };
        if ips.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no addresses for host '{}'",
                host_name
            )));
        }
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();
        for ip in ips {
            match ip {
                IpAddr::V4(ip) => ipv4.push(ip),
                IpAddr::V6(ip) => ipv6.push(ip),
            }
        }

        let service_name = DomainName::from_str(trim_dots(&self.service))
            .map_err(|_| invalid_name("service", &self.service))?;
        let domain_name = DomainName::from_str(trim_dots(&self.domain))
            .map_err(|_| invalid_name("domain", &self.domain))?;
        let host =
            DomainName::from_str(&host_name).map_err(|_| invalid_name("host", &host_name))?;

        let mut service_addr = service_name;
        service_addr.extend(&domain_name);

        let instance_label = Label::try_new(self.instance.as_bytes())
            .map_err(|_| invalid_name("instance", &self.instance))?;
        let mut instance_addr = DomainName::from_iter([instance_label]);
        instance_addr.extend(&service_addr);

        let mut enum_addr = DomainName::from_str(TYPE_ENUMERATION_NAME).unwrap();
        enum_addr.extend(&domain_name);

        Ok(MdnsService {
            instance: self.instance,
            port: self.port,
            ipv4,
            ipv6,
            txt: self.txt,
            host_name: host,
            service_addr,
            instance_addr,
            enum_addr,
        })
    }
}

fn invalid_name(what: &str, s: &str) -> Error {
    Error::InvalidArgument(format!("invalid {} name '{}'", what, s))
}

/// One advertised service instance and the records derived from it.
///
/// A service is immutable once built; to change it, build a new one and swap it into the
/// responder's [`CompositeZone`].
pub struct MdnsService {
    instance: String,
    port: u16,
    ipv4: Vec<Ipv4Addr>,
    ipv6: Vec<Ipv6Addr>,
    txt: Vec<String>,
    host_name: DomainName,
    /// `<service>.<domain>.`
    service_addr: DomainName,
    /// `<instance>.<service>.<domain>.`
    instance_addr: DomainName,
    /// `_services._dns-sd._udp.<domain>.`
    enum_addr: DomainName,
}

impl MdnsService {
    #[inline]
    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    #[inline]
    pub fn service_addr(&self) -> &DomainName {
        &self.service_addr
    }

    #[inline]
    pub fn instance_addr(&self) -> &DomainName {
        &self.instance_addr
    }

    #[inline]
    pub fn host_name(&self) -> &DomainName {
        &self.host_name
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn a_records(&self) -> Vec<Answer> {
        self.ipv4
            .iter()
            .map(|&ip| Answer::new(self.host_name.clone(), DEFAULT_TTL, Record::A(A::new(ip))))
            .collect()
    }

    fn aaaa_records(&self) -> Vec<Answer> {
        self.ipv6
            .iter()
            .map(|&ip| {
                Answer::new(
                    self.host_name.clone(),
                    DEFAULT_TTL,
                    Record::AAAA(AAAA::new(ip)),
                )
            })
            .collect()
    }

    fn txt_record(&self) -> Answer {
        Answer::new(
            self.instance_addr.clone(),
            DEFAULT_TTL,
            Record::TXT(TXT::new(self.txt.iter().map(|s| s.as_bytes().to_vec()))),
        )
    }

    /// The SRV record plus the host addresses it points at.
    fn srv_records(&self) -> Vec<Answer> {
        let mut records = vec![Answer::new(
            self.instance_addr.clone(),
            DEFAULT_TTL,
            Record::SRV(SRV::new(
                SRV_PRIORITY,
                SRV_WEIGHT,
                self.port,
                self.host_name.clone(),
            )),
        )];
        records.extend(self.a_records());
        records.extend(self.aaaa_records());
        records
    }

    fn instance_records(&self, qtype: QType) -> Vec<Answer> {
        match qtype {
            QType::ALL => {
                let mut records = self.srv_records();
                records.push(self.txt_record());
                records
            }
            QType::SRV => self.srv_records(),
            QType::A => self.a_records(),
            QType::AAAA => self.aaaa_records(),
            QType::TXT => vec![self.txt_record()],
            _ => Vec::new(),
        }
    }
}

impl Zone for MdnsService {
    fn records(&self, name: &DomainName, qtype: QType) -> Vec<Answer> {
        if name.eq_ignore_ascii_case(&self.enum_addr) {
            match qtype {
                QType::ALL | QType::PTR => vec![Answer::new(
                    self.enum_addr.clone(),
                    DEFAULT_TTL,
                    Record::PTR(PTR::new(self.service_addr.clone())),
                )],
                _ => Vec::new(),
            }
        } else if name.eq_ignore_ascii_case(&self.service_addr) {
            match qtype {
                QType::ALL | QType::PTR => {
                    // The instance bundle rides along so that the querier can complete the entry
                    // without a second round trip.
                    let mut records = vec![Answer::new(
                        self.service_addr.clone(),
                        DEFAULT_TTL,
                        Record::PTR(PTR::new(self.instance_addr.clone())),
                    )];
                    records.extend(self.instance_records(QType::ALL));
                    records
                }
                _ => Vec::new(),
            }
        } else if name.eq_ignore_ascii_case(&self.instance_addr) {
            self.instance_records(qtype)
        } else if name.eq_ignore_ascii_case(&self.host_name) {
            match qtype {
                QType::ALL => {
                    let mut records = self.a_records();
                    records.extend(self.aaaa_records());
                    records
                }
                QType::A => self.a_records(),
                QType::AAAA => self.aaaa_records(),
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        }
    }
}

impl fmt::Display for MdnsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.instance_addr, self.host_name, self.port)
    }
}

/// An ordered collection of zones queried in insertion order.
///
/// Answers are concatenated; duplicates across zones are not removed.
#[derive(Default)]
pub struct CompositeZone {
    zones: Vec<Box<dyn Zone + Send + Sync>>,
}

impl CompositeZone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a zone.
    pub fn push(&mut self, zone: impl Zone + Send + Sync + 'static) {
        self.zones.push(Box::new(zone));
    }

    /// Removes and returns the zone at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> Box<dyn Zone + Send + Sync> {
        self.zones.remove(index)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

impl Zone for CompositeZone {
    fn records(&self, name: &DomainName, qtype: QType) -> Vec<Answer> {
        self.zones
            .iter()
            .flat_map(|z| z.records(name, qtype))
            .collect()
    }
}

/// Renders a key/value map as `key=value` TXT entries.
pub fn make_txt(map: &BTreeMap<String, String>) -> Vec<String> {
    map.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Parses `key=value` TXT entries into a map.
///
/// A bare `key` without `=` maps to an empty value. Repeated keys are last-wins.
pub fn parse_txt(entries: &[String]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((k, v)) => map.insert(k.to_string(), v.to_string()),
            None => map.insert(entry.clone(), String::new()),
        };
    }
    map
}

/// Strips leading and trailing dots, turning `_http._tcp.` into `_http._tcp`.
pub(crate) fn trim_dots(s: &str) -> &str {
    s.trim_matches('.')
}

fn validate_fqdn(s: &str, what: &str) -> Result<(), Error> {
    let trimmed = trim_dots(s);
    if !s.ends_with('.') || trimmed.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{} '{}' is not a fully-qualified domain name",
            what, s
        )));
    }
    for label in trimmed.split('.') {
        if !valid_host_label(label) {
            return Err(Error::InvalidArgument(format!(
                "{} '{}' contains invalid label '{}'",
                what, s, label
            )));
        }
    }
    Ok(())
}

fn valid_host_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= Label::MAX_LEN
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-')
}

#[cfg(test)]
mod tests {
    use crate::packet::Type;

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

    fn domain(s: &str) -> DomainName {
        s.parse().unwrap()
    }

    fn types(records: &[Answer]) -> Vec<Type> {
        records.iter().map(|a| a.record.record_type()).collect()
    }

    #[test]
    fn type_enumeration_query() {
        let zone = printer();
        let records = zone.records(&domain("_services._dns-sd._udp.local."), QType::PTR);
        assert_eq!(records.len(), 1);
        match &records[0].record {
            Record::PTR(ptr) => assert_eq!(ptr.target().to_string(), "_http._tcp.local."),
            other => panic!("unexpected record: {:?}", other),
        }
        assert_eq!(records[0].ttl, DEFAULT_TTL);
    }

    #[test]
    fn service_query_carries_instance_bundle() {
        let zone = printer();
        let records = zone.records(&domain("_http._tcp.local."), QType::PTR);
        assert_eq!(types(&records), [Type::PTR, Type::SRV, Type::A, Type::TXT]);
        match &records[0].record {
            Record::PTR(ptr) => {
                assert_eq!(ptr.target().to_string(), "Printer._http._tcp.local.")
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn srv_query_includes_addresses() {
        let zone = printer();
        let records = zone.records(&domain("Printer._http._tcp.local."), QType::SRV);
        assert_eq!(types(&records), [Type::SRV, Type::A]);
        match &records[0].record {
            Record::SRV(srv) => {
                assert_eq!(srv.priority(), 10);
                assert_eq!(srv.weight(), 1);
                assert_eq!(srv.port(), 80);
                assert_eq!(srv.target().to_string(), "box.local.");
            }
            other => panic!("unexpected record: {:?}", other),
        }
        assert_eq!(records[1].name.to_string(), "box.local.");
    }

    #[test]
    fn host_query() {
        let zone = printer();
        let records = zone.records(&domain("box.local."), QType::A);
        assert_eq!(types(&records), [Type::A]);

        let records = zone.records(&domain("box.local."), QType::AAAA);
        assert!(records.is_empty());
    }

    #[test]
    fn unknown_name_is_unanswered() {
        let zone = printer();
        assert!(zone.records(&domain("unknown.local."), QType::A).is_empty());
        assert!(zone
            .records(&domain("Printer._http._tcp.local.x."), QType::ALL)
            .is_empty());
    }

    #[test]
    fn names_match_case_insensitively() {
        let zone = printer();
        let records = zone.records(&domain("pRiNtEr._HTTP._tcp.LOCAL."), QType::TXT);
        assert_eq!(types(&records), [Type::TXT]);
    }

    #[test]
    fn any_query_on_instance() {
        let zone = printer();
        let records = zone.records(&domain("Printer._http._tcp.local."), QType::ALL);
        assert_eq!(types(&records), [Type::SRV, Type::A, Type::TXT]);
    }

    #[test]
    fn builder_defaults_from_resolver() {
        let service = ServiceBuilder::new("Printer", "_http._tcp", 80)
            .build_with(&FixedResolver)
            .unwrap();
        assert_eq!(service.host_name().to_string(), "testbox.local.");
        let records = service.records(&domain("testbox.local."), QType::A);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn builder_rejects_bad_input() {
        assert!(matches!(
            ServiceBuilder::new("", "_http._tcp", 80).build_with(&FixedResolver),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ServiceBuilder::new("Printer", "_http._tcp", 0).build_with(&FixedResolver),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ServiceBuilder::new("Printer", "_http._tcp", 80)
                .host_name("box.local") // missing trailing dot
                .build_with(&FixedResolver),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ServiceBuilder::new("Printer", "_http._tcp", 80)
                .host_name("-box.local.")
                .build_with(&FixedResolver),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn composite_zone_concatenates_in_order() {
        let mut composite = CompositeZone::new();
        composite.push(printer());
        composite.push(
            ServiceBuilder::new("Scanner", "_http._tcp", 8080)
                .host_name("box.local.")
                .ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)))
                .build_with(&FixedResolver)
                .unwrap(),
        );

        let records = composite.records(&domain("_services._dns-sd._udp.local."), QType::PTR);
        assert_eq!(records.len(), 2);

        let removed = composite.remove(0);
        assert_eq!(composite.len(), 1);
        assert_eq!(
            removed
                .records(&domain("box.local."), QType::A)
                .len(),
            1
        );
    }

    #[test]
    fn txt_helpers() {
        let mut map = BTreeMap::new();
        map.insert("path".to_string(), "/".to_string());
        map.insert("ver".to_string(), "2".to_string());
        assert_eq!(make_txt(&map), ["path=/", "ver=2"]);

        let parsed = parse_txt(&[
            "path=/".to_string(),
            "flag".to_string(),
            "path=/printer".to_string(),
            "eq=a=b".to_string(),
        ]);
        assert_eq!(parsed.get("path").map(String::as_str), Some("/printer"));
        assert_eq!(parsed.get("flag").map(String::as_str), Some(""));
        assert_eq!(parsed.get("eq").map(String::as_str), Some("a=b"));
    }
}
