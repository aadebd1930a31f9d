//! Reassembly of scattered answer records into service entries.
//!
//! Answers for one service arrive spread over PTR, SRV, TXT, A, and AAAA records, possibly out
//! of order, duplicated, and split across several messages and sockets. The aggregator keeps a
//! table of partial entries and emits each entry exactly once, at the moment it becomes
//! complete.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::packet::records::{Answer, Record};
use crate::zone::trim_dots;

use super::ServiceEntry;

/// Entries live in an arena; the name table maps (normalized) names to arena indices. A PTR
/// record aliases its owner name to the target's index, so both names resolve to one entry.
pub(crate) struct Aggregator {
    /// `<service>.<domain>.`, lowercased.
    pattern: String,
    entries: Vec<ServiceEntry>,
    by_name: HashMap<String, usize>,
    completed: HashSet<String>,
}

impl Aggregator {
    pub(crate) fn new(service: &str, domain: &str) -> Self {
        Self {
            pattern: normalize(&format!("{}.{}.", trim_dots(service), trim_dots(domain))),
            entries: Vec::new(),
            by_name: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Feeds one record into the table and pushes any entries it completed onto `out`.
    pub(crate) fn ingest(&mut self, answer: &Answer, out: &mut VecDeque<ServiceEntry>) {
        let name = answer.name.to_string();
        let idx = self.index_for(&name);
        if self.entries[idx].host.is_empty() {
            self.entries[idx].host = name.clone();
        }

        match &answer.record {
            Record::PTR(ptr) => {
                let target = ptr.target().to_string();
                let target_idx = self.index_for(&target);
                self.entries[target_idx].name = target;
                // Alias: lookups on the PTR's owner name now resolve to the target entry.
                self.by_name.insert(normalize(&name), target_idx);
            }
            Record::SRV(srv) => {
                let target = srv.target().to_string();
                {
                    let entry = &mut self.entries[idx];
                    entry.host = target.clone();
                    entry.port = srv.port();
                }
                self.adopt_host_addrs(idx, &target);
            }
            Record::A(a) => {
                let addr = a.addr();
                if !self.entries[idx].addrs_v4.contains(&addr) {
                    self.entries[idx].addrs_v4.push(addr);
                }
                // Address records arrive at the host name; entries keyed by an instance name
                // that point at this host need the address too.
                let host_key = normalize(&name);
                for i in self.unique_indices() {
                    if i == idx {
                        continue;
                    }
                    let entry = &mut self.entries[i];
                    if normalize(&entry.host) == host_key && !entry.addrs_v4.contains(&addr) {
                        entry.addrs_v4.push(addr);
                    }
                }
            }
            Record::AAAA(aaaa) => {
                let addr = aaaa.addr();
                if !self.entries[idx].addrs_v6.contains(&addr) {
                    self.entries[idx].addrs_v6.push(addr);
                }
                let host_key = normalize(&name);
                for i in self.unique_indices() {
                    if i == idx {
                        continue;
                    }
                    let entry = &mut self.entries[i];
                    if normalize(&entry.host) == host_key && !entry.addrs_v6.contains(&addr) {
                        entry.addrs_v6.push(addr);
                    }
                }
            }
            Record::TXT(txt) => {
                let fields: Vec<String> = txt
                    .entries()
                    .map(|e| String::from_utf8_lossy(e).into_owned())
                    .collect();
                let entry = &mut self.entries[idx];
                entry.txt = fields.first().cloned().unwrap_or_default();
                entry.txt_fields = fields;
                entry.has_txt = true;
            }
            // NSEC and anything the codec may grow are irrelevant for reassembly.
            _ => {}
        }

        self.sweep(out);
    }

    /// Copies addresses already learned for `host` onto the entry at `idx`.
    ///
    /// Address records may arrive before the SRV record that names their host; completeness
    /// must not depend on that order.
    fn adopt_host_addrs(&mut self, idx: usize, host: &str) {
        let host_idx = match self.by_name.get(&normalize(host)) {
            Some(&i) if i != idx => i,
            _ => return,
        };
        let (v4, v6) = {
            let host_entry = &self.entries[host_idx];
            (host_entry.addrs_v4.clone(), host_entry.addrs_v6.clone())
        };
        let entry = &mut self.entries[idx];
        for addr in v4 {
            if !entry.addrs_v4.contains(&addr) {
                entry.addrs_v4.push(addr);
            }
        }
        for addr in v6 {
            if !entry.addrs_v6.contains(&addr) {
                entry.addrs_v6.push(addr);
            }
        }
    }

    /// Looks up the entry index for `name`, creating a fresh entry if there is none.
    fn index_for(&mut self, name: &str) -> usize {
        let key = normalize(name);
        if let Some(&idx) = self.by_name.get(&key) {
            return idx;
        }
        let idx = self.entries.len();
        self.entries.push(ServiceEntry::new(name));
        self.by_name.insert(key, idx);
        idx
    }

    /// The set of live arena indices, in arena order. Aliasing can orphan an index, and can make
    /// several names share one.
    fn unique_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.by_name.values().copied().collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Emits every entry that just became complete and has not been emitted yet.
    fn sweep(&mut self, out: &mut VecDeque<ServiceEntry>) {
        for i in self.unique_indices() {
            let (complete, sent, key) = {
                let entry = &self.entries[i];
                (entry.is_complete(), entry.sent, normalize(&entry.name))
            };
            if !complete || sent || self.completed.contains(&key) || !self.matches(&key) {
                continue;
            }
            self.completed.insert(key);
            let entry = &mut self.entries[i];
            entry.sent = true;
            out.push_back(entry.clone());
        }
    }

    /// Whether a (normalized) entry name belongs to the queried service: either it ends with
    /// the service pattern, or it is an instance name whose remainder after the first label
    /// equals the pattern exactly.
    fn matches(&self, key: &str) -> bool {
        key.ends_with(&self.pattern)
            || key
                .split_once('.')
                .is_some_and(|(_, rest)| rest == self.pattern)
    }
}

/// Lowercases a name and makes it dot-terminated, the key form used by the tables.
fn normalize(name: &str) -> String {
    let mut key = name.to_ascii_lowercase();
    if !key.ends_with('.') {
        key.push('.');
    }
    key
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use crate::name::DomainName;
    use crate::packet::records::{A, AAAA, NSEC, PTR, SRV, TXT};
    use crate::zone::DEFAULT_TTL;

    use super::*;

    fn answer(name: &str, record: Record) -> Answer {
        Answer::new(DomainName::from_str(name).unwrap(), DEFAULT_TTL, record)
    }

    fn srv(name: &str, host: &str, port: u16) -> Answer {
        answer(
            name,
            Record::SRV(SRV::new(10, 1, port, DomainName::from_str(host).unwrap())),
        )
    }

    fn a(name: &str, addr: [u8; 4]) -> Answer {
        answer(name, Record::A(A::new(Ipv4Addr::from(addr))))
    }

    fn txt(name: &str, entries: &[&str]) -> Answer {
        answer(
            name,
            Record::TXT(TXT::new(entries.iter().map(|e| e.as_bytes().to_vec()))),
        )
    }

    fn drain(agg: &mut Aggregator, answers: &[Answer]) -> Vec<ServiceEntry> {
        let mut out = VecDeque::new();
        for answer in answers {
            agg.ingest(answer, &mut out);
        }
        out.into()
    }

    #[test]
    fn completes_on_last_missing_record() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let mut out = VecDeque::new();

        agg.ingest(&a("box.local.", [192, 168, 1, 2]), &mut out);
        assert!(out.is_empty());
        agg.ingest(
            &srv("Printer._http._tcp.local.", "box.local.", 80),
            &mut out,
        );
        assert!(out.is_empty());
        agg.ingest(&txt("Printer._http._tcp.local.", &["path=/"]), &mut out);

        assert_eq!(out.len(), 1);
        let entry = &out[0];
        assert_eq!(entry.name, "Printer._http._tcp.local.");
        assert_eq!(entry.host, "box.local.");
        assert_eq!(entry.addrs_v4, [Ipv4Addr::new(192, 168, 1, 2)]);
        assert_eq!(entry.port, 80);
        assert_eq!(entry.txt, "path=/");
    }

    #[test]
    fn addresses_known_before_srv_are_adopted() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                a("box.local.", [192, 168, 1, 2]),
                answer("box.local.", Record::AAAA(AAAA::new(Ipv6Addr::LOCALHOST))),
                srv("Printer._http._tcp.local.", "box.local.", 80),
                txt("Printer._http._tcp.local.", &["path=/"]),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addrs_v4, [Ipv4Addr::new(192, 168, 1, 2)]);
        assert_eq!(out[0].addrs_v6, [Ipv6Addr::LOCALHOST]);
        assert_eq!(out[0].port, 80);
    }

    #[test]
    fn ptr_aliases_owner_to_target() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                answer(
                    "_http._tcp.local.",
                    Record::PTR(PTR::new(
                        DomainName::from_str("Printer._http._tcp.local.").unwrap(),
                    )),
                ),
                srv("Printer._http._tcp.local.", "box.local.", 80),
                txt("Printer._http._tcp.local.", &["path=/"]),
                a("box.local.", [192, 168, 1, 2]),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Printer._http._tcp.local.");
        assert_eq!(out[0].port, 80);
    }

    #[test]
    fn duplicate_addresses_are_not_double_inserted() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                srv("Printer._http._tcp.local.", "box.local.", 80),
                txt("Printer._http._tcp.local.", &["path=/"]),
                a("box.local.", [192, 168, 1, 2]),
                a("box.local.", [192, 168, 1, 2]),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addrs_v4, [Ipv4Addr::new(192, 168, 1, 2)]);
    }

    #[test]
    fn two_instances_sharing_a_host_both_get_addresses() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                srv("Printer._http._tcp.local.", "box.local.", 80),
                srv("Scanner._http._tcp.local.", "box.local.", 8080),
                txt("Printer._http._tcp.local.", &["path=/"]),
                txt("Scanner._http._tcp.local.", &["path=/scan"]),
                a("box.local.", [192, 168, 1, 2]),
            ],
        );
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|e| e.addrs_v4 == [Ipv4Addr::new(192, 168, 1, 2)]));
        let ports: Vec<u16> = out.iter().map(|e| e.port).collect();
        assert_eq!(ports, [80, 8080]);
    }

    #[test]
    fn entries_are_emitted_at_most_once() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                srv("Printer._http._tcp.local.", "box.local.", 80),
                txt("Printer._http._tcp.local.", &["path=/"]),
                a("box.local.", [192, 168, 1, 2]),
                // Repetitions of the full answer set must not re-emit.
                srv("Printer._http._tcp.local.", "box.local.", 80),
                txt("Printer._http._tcp.local.", &["path=/"]),
                a("box.local.", [192, 168, 1, 3]),
            ],
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn foreign_services_are_not_emitted() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                srv("Printer._ipp._tcp.local.", "box.local.", 631),
                txt("Printer._ipp._tcp.local.", &[]),
                a("box.local.", [192, 168, 1, 2]),
            ],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn ipv6_only_entry_completes() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[
                srv("Printer._http._tcp.local.", "box.local.", 80),
                txt("Printer._http._tcp.local.", &[]),
                answer("box.local.", Record::AAAA(AAAA::new(Ipv6Addr::LOCALHOST))),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addrs_v6, [Ipv6Addr::LOCALHOST]);
        assert!(out[0].txt_fields.is_empty());
    }

    #[test]
    fn nsec_is_ignored() {
        let mut agg = Aggregator::new("_http._tcp", "local");
        let out = drain(
            &mut agg,
            &[answer(
                "Printer._http._tcp.local.",
                Record::NSEC(NSEC::new(
                    DomainName::from_str("Printer._http._tcp.local.").unwrap(),
                    vec![0, 4, 0x40, 0, 0, 8],
                )),
            )],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn names_are_matched_case_insensitively() {
        let mut agg = Aggregator::new("_HTTP._TCP", "local");
        let out = drain(
            &mut agg,
            &[
                srv("printer._http._tcp.LOCAL.", "Box.Local.", 80),
                txt("PRINTER._http._tcp.local.", &["path=/"]),
                a("box.local.", [192, 168, 1, 2]),
            ],
        );
        assert_eq!(out.len(), 1);
    }
}
