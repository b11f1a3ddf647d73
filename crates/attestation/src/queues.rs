//! Request-coalescing queues.
//!
//! Both queues exist to guarantee at most one outbound CA round trip per
//! target: concurrent enrollment calls for the same ACA share one attempt,
//! and identical concurrent certificate requests share one `/sign` round
//! trip, with the single result fanned out to every waiter. Both queues
//! are bounded; admission over the bound is rejected, never evicted.

use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::types::{AcaType, CertificateProfile};

/// Maximum pending completion handles per ACA enrollment attempt.
pub const ENROLLMENT_QUEUE_LIMIT: usize = 50;

/// Maximum waiters sharing one in-flight certificate request.
pub const CERTIFICATE_ALIAS_LIMIT: usize = 5;

/// Outcome of asking a queue to admit a completion handle.
pub enum Admission<T> {
    /// No attempt was in flight; the caller must start one.
    StartFlight,
    /// An attempt is in flight; the handle was parked on it.
    Joined,
    /// The queue is at capacity; the handle is returned so the caller can
    /// answer it with a rejection.
    Rejected(oneshot::Sender<T>),
}

struct EnrollmentSlot<T> {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T> Default for EnrollmentSlot<T> {
    fn default() -> Self {
        Self {
            in_flight: false,
            waiters: Vec::new(),
        }
    }
}

/// Coalesces enrollment attempts per ACA flavor.
pub struct EnrollmentQueue<T> {
    slots: [EnrollmentSlot<T>; AcaType::COUNT],
    limit: usize,
}

impl<T> EnrollmentQueue<T> {
    pub fn new() -> Self {
        Self::with_limit(ENROLLMENT_QUEUE_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Default::default(),
            limit,
        }
    }

    /// Admit a completion handle for an enrollment of `aca`.
    pub fn admit(&mut self, aca: AcaType, handle: oneshot::Sender<T>) -> Admission<T> {
        let slot = &mut self.slots[aca.index()];
        if slot.waiters.len() >= self.limit {
            return Admission::Rejected(handle);
        }
        let first = !slot.in_flight;
        slot.in_flight = true;
        slot.waiters.push(handle);
        if first {
            Admission::StartFlight
        } else {
            Admission::Joined
        }
    }

    /// Mark an enrollment in flight without parking a handle. Used when a
    /// certificate flow drives the enrollment itself.
    pub fn mark_in_flight(&mut self, aca: AcaType) {
        self.slots[aca.index()].in_flight = true;
    }

    pub fn is_in_flight(&self, aca: AcaType) -> bool {
        self.slots[aca.index()].in_flight
    }

    /// Resolve the attempt: returns every parked handle and clears the slot.
    pub fn settle(&mut self, aca: AcaType) -> Vec<oneshot::Sender<T>> {
        let slot = &mut self.slots[aca.index()];
        slot.in_flight = false;
        std::mem::take(&mut slot.waiters)
    }
}

impl<T> Default for EnrollmentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a coalescable certificate request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertRequestKey {
    pub aca_type: AcaType,
    pub username: String,
    pub key_label: String,
    pub profile: CertificateProfile,
    pub origin: String,
}

struct PendingCertificate<T> {
    aliases: Vec<oneshot::Sender<T>>,
}

/// Coalesces identical certificate requests onto one in-flight CA round
/// trip, fanning the result out to every alias.
pub struct CertificateQueue<T> {
    pending: HashMap<CertRequestKey, PendingCertificate<T>>,
    alias_limit: usize,
}

impl<T> CertificateQueue<T> {
    pub fn new() -> Self {
        Self::with_alias_limit(CERTIFICATE_ALIAS_LIMIT)
    }

    pub fn with_alias_limit(alias_limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            alias_limit,
        }
    }

    /// Admit a completion handle for the request identified by `key`.
    pub fn admit(&mut self, key: &CertRequestKey, handle: oneshot::Sender<T>) -> Admission<T> {
        match self.pending.get_mut(key) {
            Some(entry) => {
                if entry.aliases.len() >= self.alias_limit {
                    Admission::Rejected(handle)
                } else {
                    entry.aliases.push(handle);
                    Admission::Joined
                }
            }
            None => {
                self.pending.insert(
                    key.clone(),
                    PendingCertificate {
                        aliases: vec![handle],
                    },
                );
                Admission::StartFlight
            }
        }
    }

    pub fn is_in_flight(&self, key: &CertRequestKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Resolve the request: returns every alias and removes the entry.
    pub fn settle(&mut self, key: &CertRequestKey) -> Vec<oneshot::Sender<T>> {
        self.pending
            .remove(key)
            .map(|entry| entry.aliases)
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for CertificateQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CertificateProfile;

    fn key(label: &str) -> CertRequestKey {
        CertRequestKey {
            aca_type: AcaType::Default,
            username: "user".to_string(),
            key_label: label.to_string(),
            profile: CertificateProfile::EnterpriseUserCertificate,
            origin: "origin".to_string(),
        }
    }

    #[test]
    fn test_first_enrollment_starts_flight() {
        let mut queue: EnrollmentQueue<u32> = EnrollmentQueue::new();
        let (tx, _rx) = oneshot::channel();
        assert!(matches!(queue.admit(AcaType::Default, tx), Admission::StartFlight));
        assert!(queue.is_in_flight(AcaType::Default));
        assert!(!queue.is_in_flight(AcaType::Test));
    }

    #[test]
    fn test_concurrent_enrollments_join() {
        let mut queue: EnrollmentQueue<u32> = EnrollmentQueue::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(matches!(queue.admit(AcaType::Default, tx1), Admission::StartFlight));
        assert!(matches!(queue.admit(AcaType::Default, tx2), Admission::Joined));

        let handles = queue.settle(AcaType::Default);
        assert_eq!(handles.len(), 2);
        assert!(!queue.is_in_flight(AcaType::Default));
    }

    #[test]
    fn test_enrollment_over_limit_rejected() {
        let mut queue: EnrollmentQueue<u32> = EnrollmentQueue::with_limit(2);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        queue.admit(AcaType::Default, tx1);
        queue.admit(AcaType::Default, tx2);
        let Admission::Rejected(handle) = queue.admit(AcaType::Default, tx3) else {
            panic!("expected rejection over the limit");
        };
        // The handle comes back so the caller can answer it.
        drop(handle);
        // Earlier waiters are untouched.
        assert_eq!(queue.settle(AcaType::Default).len(), 2);
    }

    #[test]
    fn test_chained_flow_marks_in_flight_without_waiter() {
        let mut queue: EnrollmentQueue<u32> = EnrollmentQueue::new();
        queue.mark_in_flight(AcaType::Test);
        assert!(queue.is_in_flight(AcaType::Test));

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(queue.admit(AcaType::Test, tx), Admission::Joined));
        assert_eq!(queue.settle(AcaType::Test).len(), 1);
    }

    #[test]
    fn test_identical_certificate_requests_coalesce() {
        let mut queue: CertificateQueue<u32> = CertificateQueue::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(matches!(queue.admit(&key("label"), tx1), Admission::StartFlight));
        assert!(matches!(queue.admit(&key("label"), tx2), Admission::Joined));
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.settle(&key("label")).len(), 2);
        assert!(!queue.is_in_flight(&key("label")));
    }

    #[test]
    fn test_different_requests_do_not_coalesce() {
        let mut queue: CertificateQueue<u32> = CertificateQueue::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(matches!(queue.admit(&key("a"), tx1), Admission::StartFlight));
        assert!(matches!(queue.admit(&key("b"), tx2), Admission::StartFlight));
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn test_alias_limit_rejects_sixth_request() {
        let mut queue: CertificateQueue<u32> = CertificateQueue::new();
        let mut receivers = Vec::new();
        for i in 0..CERTIFICATE_ALIAS_LIMIT {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            let admission = queue.admit(&key("label"), tx);
            if i == 0 {
                assert!(matches!(admission, Admission::StartFlight));
            } else {
                assert!(matches!(admission, Admission::Joined));
            }
        }

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(queue.admit(&key("label"), tx), Admission::Rejected(_)));
        assert_eq!(queue.settle(&key("label")).len(), CERTIFICATE_ALIAS_LIMIT);
    }

    #[test]
    fn test_settle_unknown_key_is_empty() {
        let mut queue: CertificateQueue<u32> = CertificateQueue::new();
        assert!(queue.settle(&key("missing")).is_empty());
    }
}
