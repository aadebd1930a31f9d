//! Resource record data types.
//!
//! Records are stored as owned values so that they can outlive the packet they were decoded
//! from; the querier keeps them around while it assembles service entries from many messages.

use std::{
    fmt::{self, Write},
    net::{Ipv4Addr, Ipv6Addr},
};

use crate::name::DomainName;

use super::{decoder, decoder::Reader, encoder::Writer, Class, Error, Type};

pub struct ResourceRecordEncoder<'a> {
    pub(crate) w: Writer<'a>,
}

pub struct ResourceRecordDecoder<'a> {
    pub(crate) r: Reader<'a>,
}

/// Trait implemented by all resource record data types.
pub trait RecordData: Sized {
    /// The associated resource record type.
    const TYPE: Type;

    /// Writes the data of this resource record to the given encoder.
    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>);

    /// Attempts to decode an instance of this resource record from an RDATA field.
    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error>;
}

macro_rules! records {
    (
        $($record:ident),+ $(,)?
    ) => {
        /// Enumeration of all supported Resource Record types.
        #[non_exhaustive]
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Record {
            $( $record($record), )+
        }

        impl Record {
            pub(crate) fn from_rr(rr: &decoder::ResourceRecord<'_>) -> Option<Result<Self, Error>> {
                let r = &mut ResourceRecordDecoder {
                    r: rr.rdata.clone(),
                };
                Some(match rr.type_() {
                    $( Type::$record => $record::decode(r).map(Self::$record), )+
                    _ => return None,
                })
            }

            pub(crate) fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
                match self {
                    $( Record::$record(rr) => rr.encode(enc), )+
                }
            }

            pub fn record_type(&self) -> Type {
                match self {
                    $( Record::$record(_) => Type::$record, )+
                }
            }
        }

        impl fmt::Display for Record {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $( Record::$record(r) => r.fmt(f), )+
                }
            }
        }
    };
}

records!(A, AAAA, PTR, TXT, SRV, NSEC);

/// An IPv4 host address record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct A {
    addr: Ipv4Addr,
}

impl RecordData for A {
    const TYPE: Type = Type::A;

    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
        enc.w.write_slice(&self.addr.octets())
    }

    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error> {
        Ok(Self {
            addr: Ipv4Addr::from(*dec.r.read_array()?),
        })
    }
}

impl A {
    #[inline]
    pub fn new(addr: Ipv4Addr) -> Self {
        Self { addr }
    }

    #[inline]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
}

impl fmt::Display for A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// An IPv6 host address record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AAAA {
    addr: Ipv6Addr,
}

impl RecordData for AAAA {
    const TYPE: Type = Type::AAAA;

    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
        enc.w.write_slice(&self.addr.octets());
    }

    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error> {
        Ok(Self {
            addr: Ipv6Addr::from(*dec.r.read_array()?),
        })
    }
}

impl AAAA {
    #[inline]
    pub fn new(addr: Ipv6Addr) -> Self {
        Self { addr }
    }

    #[inline]
    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }
}

impl fmt::Display for AAAA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// A pointer record, mapping a service type to a service instance name.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PTR {
    target: DomainName,
}

impl RecordData for PTR {
    const TYPE: Type = Type::PTR;

    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
        enc.w.write_domain_name(&self.target);
    }

    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error> {
        Ok(Self {
            target: dec.r.read_domain_name()?,
        })
    }
}

impl PTR {
    pub fn new(target: DomainName) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &DomainName {
        &self.target
    }
}

impl fmt::Display for PTR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.target.fmt(f)
    }
}

/// A text record, carrying service metadata as a list of *character strings*.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TXT {
    entries: Vec<Vec<u8>>,
}

impl RecordData for TXT {
    const TYPE: Type = Type::TXT;

    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
        for entry in self.entries() {
            enc.w.write_character_string(entry);
        }
    }

    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error> {
        let mut entries = Vec::new();

        // Technically at least one is required, but we accept 0 too.
        while !dec.r.buf().is_empty() {
            entries.push(dec.r.read_character_string()?.to_vec());
        }

        Ok(Self { entries })
    }
}

impl TXT {
    /// Creates a new [`TXT`] resource record containing the given `entries`.
    pub fn new<I, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        Self {
            entries: entries.into_iter().map(|t| t.into()).collect(),
        }
    }

    /// Returns an iterator over all *character string* values in this record.
    ///
    /// Each *character string* is an arbitrary sequence of bytes (empty sequences are allowed).
    /// Their interpretation is up to higher-level specifications.
    pub fn entries(&self) -> impl Iterator<Item = &'_ [u8]> {
        self.entries.iter().map(|e| &**e)
    }
}

impl fmt::Display for TXT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries().enumerate() {
            if i != 0 {
                f.write_char('\t')?;
            }

            for &byte in entry {
                if byte.is_ascii_graphic() {
                    f.write_char(byte as char)?;
                } else {
                    f.write_char('�')?;
                }
            }
        }
        Ok(())
    }
}

/// A service locator record, carrying the host and port of a service instance.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SRV {
    priority: u16,
    weight: u16,
    port: u16,
    target: DomainName,
}

impl RecordData for SRV {
    const TYPE: Type = Type::SRV;

    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
        enc.w.write_u16(self.priority);
        enc.w.write_u16(self.weight);
        enc.w.write_u16(self.port);
        enc.w.write_domain_name(&self.target);
    }

    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error> {
        Ok(Self {
            priority: dec.r.read_u16()?,
            weight: dec.r.read_u16()?,
            port: dec.r.read_u16()?,
            target: dec.r.read_domain_name()?,
        })
    }
}

impl SRV {
    pub fn new(priority: u16, weight: u16, port: u16, target: DomainName) -> Self {
        Self {
            priority,
            weight,
            port,
            target,
        }
    }

    /// Returns the priority value of this service (lower values mean that the service should be
    /// preferred).
    #[inline]
    pub fn priority(&self) -> u16 {
        self.priority
    }

    #[inline]
    pub fn weight(&self) -> u16 {
        self.weight
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn target(&self) -> &DomainName {
        &self.target
    }
}

impl fmt::Display for SRV {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.priority, self.weight, self.port, self.target,
        )
    }
}

/// A next-secure record.
///
/// mDNS responders use NSEC to assert the nonexistence of record types. This library decodes the
/// record's structure but otherwise ignores it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NSEC {
    next_domain: DomainName,
    type_bitmaps: Vec<u8>,
}

impl RecordData for NSEC {
    const TYPE: Type = Type::NSEC;

    fn encode(&self, enc: &mut ResourceRecordEncoder<'_>) {
        enc.w.write_domain_name(&self.next_domain);
        enc.w.write_slice(&self.type_bitmaps);
    }

    fn decode(dec: &mut ResourceRecordDecoder<'_>) -> Result<Self, Error> {
        let next_domain = dec.r.read_domain_name()?;
        let remaining = dec.r.buf().len();
        Ok(Self {
            next_domain,
            type_bitmaps: dec.r.read_slice(remaining)?.to_vec(),
        })
    }
}

impl NSEC {
    pub fn new(next_domain: DomainName, type_bitmaps: Vec<u8>) -> Self {
        Self {
            next_domain,
            type_bitmaps,
        }
    }

    #[inline]
    pub fn next_domain(&self) -> &DomainName {
        &self.next_domain
    }
}

impl fmt::Display for NSEC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} type-bitmap bytes)",
            self.next_domain,
            self.type_bitmaps.len()
        )
    }
}

/// An owned resource record: a name paired with decoded record data.
///
/// This is what the zone hands to the responder and what the querier feeds into its aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: DomainName,
    pub class: Class,
    pub cache_flush: bool,
    pub ttl: u32,
    pub record: Record,
}

impl Answer {
    /// Creates an internet-class answer without the cache-flush bit.
    pub fn new(name: DomainName, ttl: u32, record: Record) -> Self {
        Self {
            name,
            class: Class::IN,
            cache_flush: false,
            ttl,
            record,
        }
    }

    /// Converts a decoded resource record into an owned [`Answer`].
    ///
    /// Returns [`None`] if the record type is unsupported.
    pub fn from_rr(rr: &decoder::ResourceRecord<'_>) -> Option<Result<Self, Error>> {
        let record = match rr.data()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(Self {
            name: rr.name().clone(),
            class: rr.class(),
            cache_flush: rr.cache_flush(),
            ttl: rr.ttl(),
            record,
        }))
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            self.name,
            self.ttl,
            self.class,
            self.record.record_type(),
            self.record,
        )
    }
}
