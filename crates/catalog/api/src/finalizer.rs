//! Ordered finalizer handling.
//!
//! Finalizers on an object are cleared strictly in order: a controller may
//! only finalize an object while its own token sits at the head of the list.

#[derive(Copy, Clone, Debug)]
pub struct FinalizerQueue<'a> {
    finalizers: &'a [String],
}

impl<'a> FinalizerQueue<'a> {
    pub const fn new(finalizers: &'a [String]) -> Self {
        Self { finalizers }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.finalizers.iter().any(|finalizer| finalizer == token)
    }

    pub fn head(&self) -> Option<&'a str> {
        self.finalizers.first().map(String::as_str)
    }

    /// Claims the head of the queue if it is `token`.
    pub fn claim_head(&self, token: &str) -> Option<ClaimedFinalizer<'a>> {
        match self.finalizers.split_first() {
            Some((head, rest)) if head == token => Some(ClaimedFinalizer { rest }),
            _ => None,
        }
    }

    /// Returns the finalizer list with `token` at the tail, unless it is
    /// already present anywhere in the queue.
    pub fn with_appended(&self, token: &str) -> Vec<String> {
        let mut finalizers = self.finalizers.to_vec();
        if !self.contains(token) {
            finalizers.push(token.into());
        }
        finalizers
    }
}

/// Proof that the caller owns the head of a finalizer queue.
#[derive(Debug)]
#[must_use]
pub struct ClaimedFinalizer<'a> {
    rest: &'a [String],
}

impl<'a> ClaimedFinalizer<'a> {
    /// Pops the claimed head, yielding the remaining finalizers.
    pub fn release(self) -> Vec<String> {
        self.rest.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "kubernetes-incubator/service-catalog";

    fn finalizers(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn only_the_head_can_be_claimed() {
        let owned = finalizers(&[TOKEN, "other"]);
        let claimed = FinalizerQueue::new(&owned).claim_head(TOKEN).unwrap();
        assert_eq!(claimed.release(), finalizers(&["other"]));

        let waiting = finalizers(&["other", TOKEN]);
        let queue = FinalizerQueue::new(&waiting);
        assert!(queue.contains(TOKEN));
        assert!(queue.claim_head(TOKEN).is_none());
        assert_eq!(queue.head(), Some("other"));

        assert!(FinalizerQueue::new(&[]).claim_head(TOKEN).is_none());
    }

    #[test]
    fn appending_is_idempotent() {
        let empty = Vec::new();
        let appended = FinalizerQueue::new(&empty).with_appended(TOKEN);
        assert_eq!(appended, finalizers(&[TOKEN]));

        let again = FinalizerQueue::new(&appended).with_appended(TOKEN);
        assert_eq!(again, appended);

        let tail = FinalizerQueue::new(&finalizers(&["other"])).with_appended(TOKEN);
        assert_eq!(tail, finalizers(&["other", TOKEN]));
    }
}
