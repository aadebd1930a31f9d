//! Streaming mDNS message encoder.

use core::marker::PhantomData;
use std::mem::{align_of, size_of};

use bytemuck::{NoUninit, Zeroable};

use crate::name::DomainName;

use super::{
    records::{Answer, ResourceRecordEncoder},
    section::{self, Section},
    Error, Header, QClass, QType, CLASS_TOP_BIT,
};

pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pub(crate) pos: usize,
    trunc: bool,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            trunc: false,
        }
    }

    fn modify_header(&mut self, with: impl FnOnce(&mut Header)) {
        assert_eq!(align_of::<Header>(), 1);

        let h = bytemuck::from_bytes_mut(&mut self.buf[..size_of::<Header>()]);
        with(h);
    }

    pub(crate) fn write_slice(&mut self, data: &[u8]) {
        let avail = self.buf.len() - self.pos;
        let n = data.len().min(avail);
        if n < data.len() {
            self.trunc = true;
        }
        self.buf[self.pos..self.pos + n].copy_from_slice(&data[..n]);
        self.pos += n;
    }

    pub(crate) fn write_obj<T: NoUninit>(&mut self, obj: T) {
        self.write_slice(bytemuck::bytes_of(&obj))
    }

    pub(crate) fn write_u8(&mut self, b: u8) {
        self.write_slice(&[b]);
    }

    pub(crate) fn write_u16(&mut self, v: u16) {
        self.write_slice(&v.to_be_bytes());
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.write_slice(&v.to_be_bytes());
    }

    /// Writes `name` as an uncompressed sequence of length-prefixed labels.
    ///
    /// The encoder never emits compression pointers; readers are required to accept both forms.
    pub(crate) fn write_domain_name(&mut self, name: &DomainName) {
        for label in name.labels() {
            self.write_u8(label.as_bytes().len() as u8);
            self.write_slice(label.as_bytes());
        }
        // Implicit root label at the end.
        self.write_u8(0);
    }

    pub(crate) fn write_character_string(&mut self, string: &[u8]) {
        assert!(string.len() <= 255);
        self.write_u8(string.len() as u8);
        self.write_slice(string);
    }
}

struct EncoderInner<'a> {
    w: Writer<'a>,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl<'a> Drop for EncoderInner<'a> {
    fn drop(&mut self) {
        let trunc = self.w.trunc;
        self.w.modify_header(|h| {
            h.set_qdcount(self.qdcount);
            h.set_ancount(self.ancount);
            h.set_nscount(self.nscount);
            h.set_arcount(self.arcount);
            h.set_truncated(trunc);
        });
    }
}

/// Streaming encoder for mDNS messages.
///
/// Like the decoder, the encoder is advanced through the message sections via its `S` type
/// parameter, which prevents writing records into the wrong section.
pub struct MessageEncoder<'a, S: Section> {
    inner: EncoderInner<'a>,
    _p: PhantomData<S>,
}

impl<'a, S: Section> MessageEncoder<'a, S> {
    /// Overrides the whole message header.
    ///
    /// Note that the [`MessageEncoder`] will modify some header fields on drop, to ensure that the
    /// message can be parsed correctly.
    pub fn set_header(&mut self, header: Header) {
        self.inner.w.modify_header(|h| *h = header);
    }

    /// Finishes encoding the message, and returns the number of bytes that were written to the
    /// buffer.
    ///
    /// If the message was truncated because the provided buffer was too small, this will return
    /// [`Error::Truncated`], and the message's truncation bit will be set. In that case,
    /// the user can still decide to send the message.
    pub fn finish(self) -> Result<usize, Error> {
        let bytes_written = self.inner.w.pos;

        if self.inner.w.trunc {
            Err(Error::Truncated)
        } else {
            Ok(bytes_written)
        }
    }

    fn write_rr(&mut self, answer: &Answer) {
        let w = &mut self.inner.w;
        w.write_domain_name(&answer.name);
        w.write_u16(answer.record.record_type().code());
        let mut class = answer.class.code();
        if answer.cache_flush {
            class |= CLASS_TOP_BIT;
        }
        w.write_u16(class);
        w.write_u32(answer.ttl);
        // RDATA is preceded by its length, which is only known after encoding it, so a dummy
        // length is written first and patched afterwards.
        let lenpos = w.pos;
        w.write_u16(0);
        let before_rdata = w.pos;
        let mut enc = ResourceRecordEncoder {
            w: Writer {
                buf: &mut *w.buf,
                pos: w.pos,
                trunc: w.trunc,
            },
        };
        answer.record.encode(&mut enc);
        w.pos = enc.w.pos;
        w.trunc = enc.w.trunc;
        let rdata_len = w.pos - before_rdata;
        let finished_pos = w.pos;
        w.pos = lenpos;
        w.write_u16(rdata_len.try_into().expect("RDATA length overflows u16"));
        w.pos = finished_pos;
    }
}

impl<'a> MessageEncoder<'a, section::Question> {
    /// Creates a new message encoder that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let mut w = Writer::new(buf);
        w.write_obj(Header::zeroed());
        Self {
            inner: EncoderInner {
                w,
                qdcount: 0,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            _p: PhantomData,
        }
    }

    /// Adds a question to the *Question* section.
    pub fn question<'l>(&mut self, question: Question<'l>) {
        self.inner.w.write_domain_name(question.name);
        self.inner.w.write_u16(question.ty.code());
        let mut class = question.class.code();
        if question.unicast_response {
            class |= CLASS_TOP_BIT;
        }
        self.inner.w.write_u16(class);
        self.inner.qdcount += 1;
    }

    /// Moves the encoder to the *Answer* section.
    #[inline]
    pub fn answers(self) -> MessageEncoder<'a, section::Answer> {
        MessageEncoder {
            inner: self.inner,
            _p: PhantomData,
        }
    }
}

impl<'a> MessageEncoder<'a, section::Answer> {
    pub fn add_answer(&mut self, answer: &Answer) {
        self.write_rr(answer);
        self.inner.ancount += 1;
    }

    /// Moves the encoder to the *Authority* section.
    #[inline]
    pub fn authority(self) -> MessageEncoder<'a, section::Authority> {
        MessageEncoder {
            inner: self.inner,
            _p: PhantomData,
        }
    }

    /// Moves the encoder to the *Additional Records* section.
    #[inline]
    pub fn additional(self) -> MessageEncoder<'a, section::Additional> {
        self.authority().additional()
    }
}

impl<'a> MessageEncoder<'a, section::Authority> {
    pub fn add_authority(&mut self, answer: &Answer) {
        self.write_rr(answer);
        self.inner.nscount += 1;
    }

    /// Moves the encoder to the *Additional Records* section.
    #[inline]
    pub fn additional(self) -> MessageEncoder<'a, section::Additional> {
        MessageEncoder {
            inner: self.inner,
            _p: PhantomData,
        }
    }
}

impl<'a> MessageEncoder<'a, section::Additional> {
    pub fn add_additional(&mut self, answer: &Answer) {
        self.write_rr(answer);
        self.inner.arcount += 1;
    }
}

/// A question to be written to the *Question* section of a query.
pub struct Question<'a> {
    name: &'a DomainName,
    class: QClass,
    ty: QType,
    unicast_response: bool,
}

impl<'a> Question<'a> {
    /// Creates a question asking for all records ([`QType::ALL`]) in the internet class
    /// ([`QClass::IN`]) pertaining to `name`.
    #[inline]
    pub fn new(name: &'a DomainName) -> Self {
        Self {
            name,
            class: QClass::IN,
            ty: QType::ALL,
            unicast_response: false,
        }
    }

    /// Sets the record class to query.
    ///
    /// In almost all cases this can be left as the default value ([`QClass::IN`]), which queries
    /// records in the Internet class.
    #[inline]
    pub fn class(self, class: QClass) -> Self {
        Self { class, ..self }
    }

    /// Sets the resource type to query.
    #[inline]
    pub fn ty(self, ty: QType) -> Self {
        Self { ty, ..self }
    }

    /// Requests a unicast response by setting the top bit of the class field.
    #[inline]
    pub fn unicast_response(self, unicast: bool) -> Self {
        Self {
            unicast_response: unicast,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use crate::hex::Hex;
    use crate::packet::decoder::MessageDecoder;
    use crate::packet::records::{Record, A, AAAA, PTR, SRV, TXT};

    use super::*;

    fn domain(s: &str) -> DomainName {
        s.parse().unwrap()
    }

    #[test]
    fn encode_domain_name() {
        let mut buf = [0; 64];
        let mut w = Writer::new(&mut buf);
        w.write_domain_name(&domain("_http._tcp.local."));
        let pos = w.pos;
        assert_eq!(
            Hex(&buf[..pos]).to_string(),
            "055f68747470045f746370056c6f63616c00"
        );
    }

    #[test]
    fn encode_query_with_unicast_bit() {
        let mut buf = [0; 128];
        let mut enc = MessageEncoder::new(&mut buf);
        let name = domain("_http._tcp.local.");
        enc.question(
            Question::new(&name)
                .ty(QType::PTR)
                .unicast_response(true),
        );
        let len = enc.finish().unwrap();

        // The class field is the final two bytes: unicast-response bit | IN.
        assert_eq!(&buf[len - 2..len], &[0x80, 0x01]);
        // qdcount was patched into the header.
        assert_eq!(&buf[4..6], &[0x00, 0x01]);
    }

    #[test]
    fn encode_answer_with_cache_flush() {
        let mut buf = [0; 128];
        let enc = MessageEncoder::new(&mut buf);
        let mut enc = enc.answers();
        let mut answer = Answer::new(
            domain("box.local."),
            120,
            Record::A(A::new(Ipv4Addr::new(192, 168, 1, 2))),
        );
        answer.cache_flush = true;
        enc.add_answer(&answer);
        let len = enc.finish().unwrap();

        // name(11) + type(2) = 13 bytes, then the class field.
        assert_eq!(&buf[12 + 13..12 + 15], &[0x80, 0x01]);
        // A RDATA is the big-endian IPv4 address.
        assert_eq!(&buf[len - 4..len], &[0xc0, 0xa8, 0x01, 0x02]);
    }

    #[test]
    fn message_roundtrip() {
        let answers = [
            Answer::new(
                domain("_http._tcp.local."),
                120,
                Record::PTR(PTR::new(domain("Printer._http._tcp.local."))),
            ),
            Answer::new(
                domain("Printer._http._tcp.local."),
                120,
                Record::SRV(SRV::new(10, 1, 80, domain("box.local."))),
            ),
            Answer::new(
                domain("Printer._http._tcp.local."),
                120,
                Record::TXT(TXT::new([&b"path=/"[..]])),
            ),
            Answer::new(
                domain("box.local."),
                120,
                Record::A(A::new(Ipv4Addr::new(192, 168, 1, 2))),
            ),
            Answer::new(domain("box.local."), 120, Record::AAAA(AAAA::new(Ipv6Addr::LOCALHOST))),
        ];

        let mut buf = [0; 512];
        let mut enc = MessageEncoder::new(&mut buf);
        let mut header = Header::default();
        header.set_id(99);
        enc.set_header(header);
        let qname = domain("_http._tcp.local.");
        enc.question(Question::new(&qname).ty(QType::PTR));
        let mut enc = enc.answers();
        for answer in &answers {
            enc.add_answer(answer);
        }
        let len = enc.finish().unwrap();

        let mut dec = MessageDecoder::new(&buf[..len]).unwrap();
        assert_eq!(dec.header().id(), 99);
        assert_eq!(dec.header().question_count(), 1);
        assert_eq!(dec.header().answer_count(), 5);
        let q = dec.next().unwrap().unwrap();
        assert_eq!(q.qname().to_string(), "_http._tcp.local.");
        assert_eq!(q.qtype(), QType::PTR);
        assert!(!q.unicast_response());

        let mut dec = dec.answers().unwrap();
        let decoded: Vec<Answer> = dec
            .iter()
            .map(|rr| Answer::from_rr(&rr.unwrap()).unwrap().unwrap())
            .collect();
        assert_eq!(decoded, answers);
    }

    #[test]
    fn truncation_sets_tc_bit() {
        let mut buf = [0; 20];
        let enc = MessageEncoder::new(&mut buf);
        let mut enc = enc.answers();
        let answer = Answer::new(
            domain("a-rather-long-name.local."),
            120,
            Record::PTR(PTR::new(domain("target.local."))),
        );
        enc.add_answer(&answer);
        assert_eq!(enc.finish(), Err(Error::Truncated));

        let header: Header = bytemuck::pod_read_unaligned(&buf[..12]);
        assert!(header.is_truncated());
    }
}
