//! mDNS message decoder and encoder.
//!
//! The codec is split into a streaming [`decoder`] and [`encoder`] that walk the four message
//! sections in order, and the [`records`] module holding the owned record data types.

pub mod decoder;
pub mod encoder;
mod error;
pub mod records;

use core::fmt;

use bitflags::bitflags;

pub use error::Error;

/// The top bit of a class field.
///
/// On a question this is the unicast-response request bit; on a resource record it is the
/// cache-flush bit. The remaining 15 bits are the class code.
pub(crate) const CLASS_TOP_BIT: u16 = 0x8000;

/// Mask extracting the class code from a wire class field.
pub(crate) const CLASS_MASK: u16 = 0x7FFF;

/// Generates an open enum over a wire code: a newtype with named constants for the assigned
/// values, conversions from the raw code, and `Debug`/`Display` that fall back to the numeric
/// value for unassigned codes (which must survive round trips).
macro_rules! wire_enum {
    (
        $( #[$attrs:meta] )*
        $v:vis enum $name:ident: $native:ty {
            $(
                $( #[$variant_attrs:meta] )*
                $variant:ident = $value:expr
            ),+
            $(,)?
        }
    ) => {
        $( #[$attrs] )*
        #[derive(Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(transparent)]
        $v struct $name($native);

        impl $name {
            $(
                $( #[$variant_attrs] )*
                $v const $variant: Self = Self($value);
            )+

            /// Returns the raw wire value.
            #[inline]
            $v fn code(self) -> $native {
                self.0
            }
        }

        impl From<$native> for $name {
            #[inline]
            fn from(code: $native) -> Self {
                Self(code)
            }
        }

        #[allow(unreachable_patterns)]
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let known = match *self {
                    $( Self::$variant => stringify!($variant), )+
                    _ => return write!(f, "{}({:#x})", stringify!($name), self.0),
                };
                f.write_str(known)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

wire_enum! {
    /// DNS message operation codes.
    pub enum Opcode: u8 {
        /// Query (or response to a query).
        ///
        /// The only opcode used by mDNS; messages with any other opcode are ignored by responders.
        QUERY = 0,

        /// Inverse Query (obsolete).
        IQUERY = 1,

        /// Server status request.
        STATUS = 2,

        NOTIFY = 4,
        UPDATE = 5,
    }
}

wire_enum! {
    /// Server response codes.
    ///
    /// Note that only rcodes with a value of 15 or less can be represented in the message's
    /// [`Header`].
    pub enum RCode: u8 {
        /// No error.
        NO_ERROR = 0,
        /// The query sent by the client was erroneous.
        FORM_ERR = 1,
        /// A server-side error prevented processing of the query.
        SERV_FAIL = 2,
        /// Signifies that the queried domain name does not exist.
        ///
        /// May only be sent by an authoritative name server.
        NX_DOMAIN = 3,
        /// The requested query type is not supported by the server.
        NOT_IMP = 4,
        /// The server refused to answer the query for policy reasons.
        REFUSED = 5,
    }
}

wire_enum! {
    /// Resource Record types.
    ///
    /// The list covers the types relevant for mDNS service discovery plus the common unicast DNS
    /// types; the decoder skips any type it does not recognize.
    pub enum Type: u16 {
        A = 1,
        NS = 2,
        CNAME = 5,
        SOA = 6,
        PTR = 12,
        HINFO = 13,
        MX = 15,
        TXT = 16,
        AAAA = 28,
        SRV = 33,
        OPT = 41,
        NSEC = 47,
    }
}

wire_enum! {
    /// The queried resource type that a client is interested in.
    pub enum QType: u16 {
        // Prefix is identical to `Type`.
        A = 1,
        NS = 2,
        CNAME = 5,
        SOA = 6,
        PTR = 12,
        HINFO = 13,
        MX = 15,
        TXT = 16,
        AAAA = 28,
        SRV = 33,
        NSEC = 47,

        /// Query is for all record types.
        ALL = 255,
    }
}

impl QType {
    pub fn matches(&self, ty: Type) -> bool {
        match *self {
            Self::ALL => true,
            _ => self.0 == ty.0,
        }
    }
}

wire_enum! {
    /// Resource Record classes.
    pub enum Class: u16 {
        /// The Internet.
        IN = 1,
        /// CSNET.
        CS = 2,
        /// Chaosnet.
        CH = 3,
        /// Hesiod.
        HS = 4,
    }
}

wire_enum! {
    /// The queried resource class.
    pub enum QClass: u16 {
        // Prefix is identical to `Class`.

        /// The Internet.
        IN = 1,
        /// CSNET.
        CS = 2,
        /// Chaosnet.
        CH = 3,
        /// Hesiod.
        HS = 4,

        /// Query is for all classes of resource.
        ANY = 255,
    }
}

impl QClass {
    pub fn matches(&self, class: Class) -> bool {
        if *self == Self::ANY {
            true
        } else {
            self.0 == class.0
        }
    }
}

/// Marker types tracking which message section a codec is positioned at.
///
/// Decoder and encoder carry one of these as a type parameter, so that records can only be read
/// from or written to the section the codec has reached.
pub mod section {
    mod sealed {
        pub trait Sealed: 'static {}
    }

    /// Trait implemented by the four section markers.
    pub trait Section: sealed::Sealed {
        /// Position of the section in a message, in wire order.
        const INDEX: usize;
    }

    macro_rules! sections {
        ($( $( #[$doc:meta] )* $name:ident = $index:expr ),+ $(,)?) => {
            $(
                $( #[$doc] )*
                pub enum $name {}
                impl sealed::Sealed for $name {}
                impl Section for $name {
                    const INDEX: usize = $index;
                }
            )+
        };
    }

    sections! {
        /// The *Question* section.
        Question = 0,
        /// The *Answer* section.
        Answer = 1,
        /// The *Authority* section.
        Authority = 2,
        /// The *Additional Records* section.
        Additional = 3,
    }
}

// Bit positions in the header flags are inverted, because RFC 1035 starts counting at the MSb.
const fn be_pos(pos: u16) -> u16 {
    15 - pos
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    #[repr(transparent)]
    struct HeaderFlags: u16 {
        /// If set, the message is a response to a query. If unset, it is a query.
        const QR = 1 << be_pos(0);
        const OPCODE = Self::OPCODE_MASK;
        /// Set if this response was sent from a name server that is the authority for the queried
        /// domain name.
        const AA = 1 << be_pos(5);
        /// Set if the message was truncated because it is longer than the maximum allowed length of
        /// the transmission channel.
        const TC = 1 << be_pos(6);
        /// Recursion Desired. Meaningless for mDNS; preserved when parsing.
        const RD = 1 << be_pos(7);
        /// Recursion Available. Meaningless for mDNS; preserved when parsing.
        const RA = 1 << be_pos(8);
        const Z = 0b111 << be_pos(9);
        const RCODE = Self::RCODE_MASK;
    }
}

impl HeaderFlags {
    const OPCODE_POS: u16 = 11;
    const OPCODE_MASK: u16 = 0b1111 << Self::OPCODE_POS;

    const RCODE_POS: u16 = 0;
    const RCODE_MASK: u16 = 0b1111 << Self::RCODE_POS;
}

/// Message header.
///
/// Fields are kept in wire order and byte order, so the header can be read from and written to a
/// message buffer as plain bytes; accessors convert at the edges.
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, packed)]
pub struct Header {
    id: u16,
    flags: u16,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl Header {
    fn flags_bits(&self) -> u16 {
        u16::from_be(self.flags)
    }

    fn set_flags_bits(&mut self, bits: u16) {
        self.flags = bits.to_be();
    }

    fn flag(&self, flag: HeaderFlags) -> bool {
        HeaderFlags::from_bits_retain(self.flags_bits()).contains(flag)
    }

    fn set_flag(&mut self, flag: HeaderFlags, value: bool) {
        let mut flags = HeaderFlags::from_bits_retain(self.flags_bits());
        flags.set(flag, value);
        self.set_flags_bits(flags.bits());
    }

    /// Returns the 16-bit message ID.
    ///
    /// Multicast responses carry an ID of 0; unicast responses echo the ID of the query they
    /// answer.
    #[inline]
    pub fn id(&self) -> u16 {
        u16::from_be(self.id)
    }

    #[inline]
    pub fn set_id(&mut self, id: u16) {
        self.id = id.to_be();
    }

    #[inline]
    pub fn is_query(&self) -> bool {
        !self.is_response()
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.flag(HeaderFlags::QR)
    }

    pub fn set_response(&mut self, is_response: bool) {
        self.set_flag(HeaderFlags::QR, is_response);
    }

    /// Returns whether the truncation flag is set, indicating that the message was truncated to
    /// fit in the transport channel.
    pub fn is_truncated(&self) -> bool {
        self.flag(HeaderFlags::TC)
    }

    pub fn set_truncated(&mut self, trunc: bool) {
        self.set_flag(HeaderFlags::TC, trunc);
    }

    pub fn is_authority(&self) -> bool {
        self.flag(HeaderFlags::AA)
    }

    pub fn set_authority(&mut self, aa: bool) {
        self.set_flag(HeaderFlags::AA, aa);
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from(((self.flags_bits() & HeaderFlags::OPCODE_MASK) >> HeaderFlags::OPCODE_POS) as u8)
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        let bits = self.flags_bits() & !HeaderFlags::OPCODE_MASK;
        self.set_flags_bits(
            bits | ((u16::from(opcode.code()) << HeaderFlags::OPCODE_POS) & HeaderFlags::OPCODE_MASK),
        );
    }

    pub fn rcode(&self) -> RCode {
        RCode::from(((self.flags_bits() & HeaderFlags::RCODE_MASK) >> HeaderFlags::RCODE_POS) as u8)
    }

    pub fn set_rcode(&mut self, rcode: RCode) {
        let bits = self.flags_bits() & !HeaderFlags::RCODE_MASK;
        self.set_flags_bits(
            bits | ((u16::from(rcode.code()) << HeaderFlags::RCODE_POS) & HeaderFlags::RCODE_MASK),
        );
    }

    pub fn question_count(&self) -> u16 {
        u16::from_be(self.qdcount)
    }

    pub fn answer_count(&self) -> u16 {
        u16::from_be(self.ancount)
    }

    pub fn authoritative_count(&self) -> u16 {
        u16::from_be(self.nscount)
    }

    pub fn additional_count(&self) -> u16 {
        u16::from_be(self.arcount)
    }

    fn set_qdcount(&mut self, qdcount: u16) {
        self.qdcount = qdcount.to_be();
    }

    fn set_ancount(&mut self, ancount: u16) {
        self.ancount = ancount.to_be();
    }

    fn set_nscount(&mut self, nscount: u16) {
        self.nscount = nscount.to_be();
    }

    fn set_arcount(&mut self, arcount: u16) {
        self.arcount = arcount.to_be();
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("id", &self.id())
            .field("flags", &HeaderFlags::from_bits_retain(self.flags_bits()))
            .field("qdcount", &self.question_count())
            .field("ancount", &self.answer_count())
            .field("nscount", &self.authoritative_count())
            .field("arcount", &self.additional_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header() {
        let mut h = Header::default();
        assert!(h.is_query());
        assert!(!h.is_authority());
        assert!(!h.is_response());

        assert_eq!(h.opcode(), Opcode::QUERY);
        h.set_opcode(Opcode::UPDATE);
        assert_eq!(h.opcode(), Opcode::UPDATE);
        h.set_opcode(Opcode::QUERY);
        assert_eq!(h.opcode(), Opcode::QUERY);

        assert_eq!(h.rcode(), RCode::NO_ERROR);
        h.set_rcode(RCode::REFUSED);
        assert_eq!(h.rcode(), RCode::REFUSED);
        h.set_rcode(RCode::NO_ERROR);
        assert_eq!(h.rcode(), RCode::NO_ERROR);
    }

    #[test]
    fn standard_response_flags() {
        // QR | AA, everything else clear.
        let mut h = Header::default();
        h.set_response(true);
        h.set_authority(true);
        assert_eq!(h.flags_bits(), 0x8400);
    }

    #[test]
    fn wire_enum_codes() {
        assert_eq!(Type::from(12), Type::PTR);
        assert_eq!(Type::PTR.code(), 12);
        assert_eq!(format!("{}", Type::from(999)), "Type(0x3e7)");
    }

    #[test]
    fn qtype_matching() {
        assert!(QType::ALL.matches(Type::SRV));
        assert!(QType::PTR.matches(Type::PTR));
        assert!(!QType::PTR.matches(Type::SRV));
    }
}
