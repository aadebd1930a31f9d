//! Streaming mDNS message decoder.

use std::{fmt, marker::PhantomData, mem::size_of};

use bytemuck::AnyBitPattern;

use crate::name::{DomainName, Label};

use super::{
    records::Record,
    section::{self, Section},
    Class, Error, Header, QClass, QType, Type, CLASS_MASK, CLASS_TOP_BIT,
};

/// A cursor over one datagram.
///
/// The reader keeps the entire message around even while positioned in the middle of it, because
/// compressed domain names may point back at earlier bytes.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    /// The buffer containing the whole DNS message.
    msg: &'a [u8],
    /// The current reader position in the buffer.
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { msg: buf, pos: 0 }
    }

    /// The not-yet-consumed remainder of the message.
    pub(crate) fn buf(&self) -> &'a [u8] {
        &self.msg[self.pos..]
    }

    pub(crate) fn read_obj<T: AnyBitPattern>(&mut self) -> Result<T, Error> {
        let bytes = self.buf().get(..size_of::<T>()).ok_or(Error::UnexpectedEof)?;
        self.pos += size_of::<T>();
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub(crate) fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(len).ok_or(Error::UnexpectedEof)?;
        let slice = self
            .msg
            .get(self.pos..end)
            .ok_or(Error::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_array<const LEN: usize>(&mut self) -> Result<&'a [u8; LEN], Error> {
        Ok(self.read_slice(LEN)?.try_into().unwrap())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(*self.read_array()?))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(*self.read_array()?))
    }

    /// Reads a `<character-string>` value.
    pub(crate) fn read_character_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u8()?;
        self.read_slice(len.into())
    }

    /// Returns a reader over the next `len` bytes, advancing this one past them.
    ///
    /// The sub-reader keeps the message prefix so that compression pointers inside it still
    /// resolve, but it cannot read past the `len` bytes.
    fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>, Error> {
        let end = self.pos.checked_add(len).ok_or(Error::UnexpectedEof)?;
        if end > self.msg.len() {
            return Err(Error::UnexpectedEof);
        }
        let sub = Reader {
            msg: &self.msg[..end],
            pos: self.pos,
        };
        self.pos = end;
        Ok(sub)
    }

    /// Reads a `<domain-name>` value, following compression pointers.
    ///
    /// The cursor resumes right after the first pointer (or after the terminator if the name is
    /// not compressed). Every pointer must target a strictly earlier offset than anything read
    /// for this name so far, which rules out self-references and pointer cycles.
    pub(crate) fn read_domain_name(&mut self) -> Result<DomainName, Error> {
        let mut name = DomainName::ROOT;
        // Where the cursor resumes; set when the first pointer is followed.
        let mut resume = None;
        let mut pos = self.pos;
        let mut floor = self.pos;
        loop {
            let len = *self.msg.get(pos).ok_or(Error::UnexpectedEof)?;
            match len & 0b1100_0000 {
                0b1100_0000 => {
                    // 14-bit pointer to somewhere earlier in the message.
                    let lo = *self.msg.get(pos + 1).ok_or(Error::UnexpectedEof)?;
                    let target = usize::from(len & 0b0011_1111) << 8 | usize::from(lo);
                    if target >= floor {
                        return Err(Error::PointerLoop);
                    }
                    if resume.is_none() {
                        resume = Some(pos + 2);
                    }
                    floor = target;
                    pos = target;
                }
                0b0000_0000 => {
                    pos += 1;

                    // Length byte followed by a label of that many bytes.
                    let len = usize::from(len);
                    if len == 0 {
                        break;
                    }
                    let label = self
                        .msg
                        .get(pos..pos + len)
                        .ok_or(Error::UnexpectedEof)?;
                    name.push_label(Label::try_new(label)?);
                    pos += len;
                }
                _ => return Err(Error::ReservedValue), // anything but 00 and 11 in the MSbs
            }
        }

        self.pos = resume.unwrap_or(pos);
        Ok(name)
    }

    fn read_question(&mut self) -> Result<Question, Error> {
        let qname = self.read_domain_name()?;
        let qtype = QType::from(self.read_u16()?);
        let raw_class = self.read_u16()?;
        Ok(Question {
            qname,
            qtype,
            qclass: QClass::from(raw_class & CLASS_MASK),
            unicast_response: raw_class & CLASS_TOP_BIT != 0,
        })
    }

    fn read_resource_record(&mut self) -> Result<ResourceRecord<'a>, Error> {
        let name = self.read_domain_name()?;
        let type_ = Type::from(self.read_u16()?);
        let raw_class = self.read_u16()?;
        let ttl = self.read_u32()?;
        let rdlength = self.read_u16()?;
        let rdata = self.sub_reader(usize::from(rdlength))?;
        Ok(ResourceRecord {
            name,
            type_,
            class: Class::from(raw_class & CLASS_MASK),
            cache_flush: raw_class & CLASS_TOP_BIT != 0,
            ttl,
            rdata,
        })
    }
}

/// Streaming decoder for mDNS messages.
///
/// A message carries its sections in a fixed wire order (Question, Answer, Authority,
/// Additional), and the decoder's `S` type parameter names the section it is positioned at. A
/// fresh decoder starts at [`section::Question`]; the section-advancing methods consume the
/// decoder and return it retyped at the next section, so records cannot be read from the wrong
/// one. The per-section entry counts come from the header and are tracked in wire order.
pub struct MessageDecoder<'a, S: Section> {
    header: Header,
    /// Unread entries per section, indexed by [`Section::INDEX`].
    remaining: [u16; 4],
    reader: Reader<'a>,
    poisoned: bool,
    section: PhantomData<(S, *const ())>, // not Send/Sync
}

impl<'a> MessageDecoder<'a, section::Question> {
    /// Creates a streaming message decoder that will read from `buf`.
    pub fn new(buf: &'a [u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buf);
        let header = reader.read_obj::<Header>()?;
        Ok(Self {
            header,
            remaining: [
                header.question_count(),
                header.answer_count(),
                header.authoritative_count(),
                header.additional_count(),
            ],
            reader,
            poisoned: false,
            section: PhantomData,
        })
    }
}

impl<'a, S: Section> MessageDecoder<'a, S> {
    /// Returns the message header.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    fn remaining_mut(&mut self) -> &mut u16 {
        &mut self.remaining[S::INDEX]
    }

    fn change_section<N: Section>(self) -> MessageDecoder<'a, N> {
        MessageDecoder {
            header: self.header,
            remaining: self.remaining,
            reader: self.reader,
            poisoned: self.poisoned,
            section: PhantomData,
        }
    }

    fn next_record(&mut self) -> Option<Result<ResourceRecord<'a>, Error>> {
        if self.poisoned || *self.remaining_mut() == 0 {
            return None;
        }

        let rr = match self.reader.read_resource_record() {
            Ok(rr) => rr,
            Err(e) => {
                self.poisoned = true;
                return Some(Err(e));
            }
        };

        *self.remaining_mut() -= 1;

        Some(Ok(rr))
    }

    /// Discards the unread resource records of the current section.
    fn skip_rrs(&mut self) -> Result<(), Error> {
        while let Some(res) = self.next_record() {
            res?;
        }
        Ok(())
    }
}

impl<'a> MessageDecoder<'a, section::Question> {
    /// Reads the next [`Question`] from the *Question* section.
    pub fn next(&mut self) -> Option<Result<Question, Error>> {
        if self.poisoned || *self.remaining_mut() == 0 {
            return None;
        }

        let question = match self.reader.read_question() {
            Ok(q) => q,
            Err(e) => {
                self.poisoned = true;
                return Some(Err(e));
            }
        };

        *self.remaining_mut() -= 1;

        Some(Ok(question))
    }

    /// Returns an iterator over all [`Question`]s in the *Question* section of the message.
    pub fn iter(&mut self) -> QuestionIter<'_, 'a> {
        QuestionIter { dec: self }
    }

    /// Skips the remaining entries in the *Question* section and advances the decoder to the
    /// *Answer* section.
    pub fn answers(mut self) -> Result<MessageDecoder<'a, section::Answer>, Error> {
        while let Some(res) = self.next() {
            res?;
        }

        Ok(self.change_section())
    }

    /// Skips the remaining entries in the *Question* section, as well as all entries in the
    /// *Answer* section, and advances the decoder to the *Authority* section.
    pub fn authority(self) -> Result<MessageDecoder<'a, section::Authority>, Error> {
        self.answers()?.authority()
    }

    /// Skips the remaining entries in the *Question* section, as well as all entries in the
    /// *Answer* and *Authority* sections, and advances the decoder to the *Additional Records*
    /// section.
    pub fn additional(self) -> Result<MessageDecoder<'a, section::Additional>, Error> {
        self.authority()?.additional()
    }
}

impl<'a> MessageDecoder<'a, section::Answer> {
    /// Reads the next [`ResourceRecord`] from the *Answer* section.
    pub fn next(&mut self) -> Option<Result<ResourceRecord<'a>, Error>> {
        self.next_record()
    }

    /// Returns an iterator over all resource records in the *Answer* section.
    pub fn iter(&mut self) -> ResourceRecordIter<'_, 'a, section::Answer> {
        ResourceRecordIter { dec: self }
    }

    /// Skips the remaining entries in the *Answer* section, and advances the decoder to the
    /// *Authority* section.
    pub fn authority(mut self) -> Result<MessageDecoder<'a, section::Authority>, Error> {
        self.skip_rrs()?;
        Ok(self.change_section())
    }

    /// Skips the remaining entries in the *Answer* section, as well as all entries in the
    /// *Authority* section, and advances the decoder to the *Additional Records* section.
    pub fn additional(self) -> Result<MessageDecoder<'a, section::Additional>, Error> {
        self.authority()?.additional()
    }
}

impl<'a> MessageDecoder<'a, section::Authority> {
    /// Reads the next [`ResourceRecord`] from the *Authority* section.
    pub fn next(&mut self) -> Option<Result<ResourceRecord<'a>, Error>> {
        self.next_record()
    }

    /// Returns an iterator over all resource records in the *Authority* section.
    pub fn iter(&mut self) -> ResourceRecordIter<'_, 'a, section::Authority> {
        ResourceRecordIter { dec: self }
    }

    pub fn additional(mut self) -> Result<MessageDecoder<'a, section::Additional>, Error> {
        self.skip_rrs()?;
        Ok(self.change_section())
    }
}

impl<'a> MessageDecoder<'a, section::Additional> {
    /// Reads the next [`ResourceRecord`] from the *Additional Records* section.
    pub fn next(&mut self) -> Option<Result<ResourceRecord<'a>, Error>> {
        self.next_record()
    }

    /// Returns an iterator over all resource records in the *Additional Records* section.
    pub fn iter(&mut self) -> ResourceRecordIter<'_, 'a, section::Additional> {
        ResourceRecordIter { dec: self }
    }
}

/// Iterator over Resource Records in a DNS message.
pub struct ResourceRecordIter<'dec, 'data, S: Section> {
    dec: &'dec mut MessageDecoder<'data, S>,
}

impl<'dec, 'data, S: Section> Iterator for ResourceRecordIter<'dec, 'data, S> {
    type Item = Result<ResourceRecord<'data>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.dec.next_record()
    }
}

/// A Resource Record from the *Answer*, *Authority*, or *Additional Records* section.
pub struct ResourceRecord<'a> {
    name: DomainName,
    type_: Type,
    class: Class,
    cache_flush: bool,
    ttl: u32,
    /// Record data, as a [`Reader`] pointing at the RDATA.
    pub(crate) rdata: Reader<'a>,
}

impl<'a> ResourceRecord<'a> {
    #[inline]
    pub fn name(&self) -> &DomainName {
        &self.name
    }

    #[inline]
    pub fn type_(&self) -> Type {
        self.type_
    }

    #[inline]
    pub fn class(&self) -> Class {
        self.class
    }

    /// Returns whether the record's mDNS cache-flush bit is set.
    #[inline]
    pub fn cache_flush(&self) -> bool {
        self.cache_flush
    }

    /// Returns the record's Time To Live, in seconds.
    #[inline]
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Returns the raw record data.
    #[inline]
    pub fn rdata(&self) -> &[u8] {
        self.rdata.buf()
    }

    /// If this is a supported record type, decodes it and returns the corresponding [`Record`].
    ///
    /// Returns [`None`] if the record type is unsupported by this library.
    pub fn data(&self) -> Option<Result<Record, Error>> {
        Record::from_rr(self)
    }
}

impl<'a> fmt::Debug for ResourceRecord<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("ResourceRecord");
        dbg.field("name", &self.name)
            .field("type_", &self.type_)
            .field("class", &self.class)
            .field("cache_flush", &self.cache_flush)
            .field("ttl", &self.ttl);
        match self.data() {
            Some(Ok(rec)) => dbg.field("rdata", &rec),
            Some(res @ Err(_)) => dbg.field("rdata", &res),
            None => dbg.field("rdata", &self.rdata),
        };
        dbg.finish()
    }
}

impl<'a> fmt::Display for ResourceRecord<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t",
            self.name(),
            self.ttl(),
            self.class(),
            self.type_()
        )?;
        match self.data() {
            Some(Ok(rr)) => {
                write!(f, "{}", rr)?;
            }
            Some(Err(e)) => {
                write!(f, "{}", e)?;
            }
            None => {
                write!(f, "{:02x?}", self.rdata())?;
            }
        }

        Ok(())
    }
}

/// An iterator over [`Question`]s in the *Question* section of a DNS message.
pub struct QuestionIter<'dec, 'data> {
    dec: &'dec mut MessageDecoder<'data, section::Question>,
}

impl<'dec, 'data> Iterator for QuestionIter<'dec, 'data> {
    type Item = Result<Question, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.dec.next()
    }
}

/// A question from a DNS query message.
#[derive(Debug)]
pub struct Question {
    qname: DomainName,
    qtype: QType,
    qclass: QClass,
    unicast_response: bool,
}

impl Question {
    /// Returns the domain name that is being queried.
    #[inline]
    pub fn qname(&self) -> &DomainName {
        &self.qname
    }

    /// Returns the resource record types the client is interested in.
    #[inline]
    pub fn qtype(&self) -> QType {
        self.qtype
    }

    /// Returns the record class that the client is interested in.
    #[inline]
    pub fn qclass(&self) -> QClass {
        self.qclass
    }

    /// Returns whether the question's unicast-response bit is set.
    ///
    /// A querier sets this bit to request that the answer be sent directly back to it instead of
    /// to the multicast group.
    #[inline]
    pub fn unicast_response(&self) -> bool {
        self.unicast_response
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.qname(), self.qclass(), self.qtype())
    }
}
