use std::task::Waker;

/// Token identifying one waiter's slot in a [`WaiterSet`]. Deliberately not
/// `Clone`: a token's lifespan tracks exactly one future, which keeps slot
/// bookkeeping honest.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WaiterToken(usize);

/// The wakers parked on one shared load group.
///
/// Only one task actually drives the group's work (the window future, then
/// the bulk fetch); the rest sleep until results are ready. The set tracks a
/// "driver": the most recently parked or reparked waker, on the assumption
/// that its task just polled the group. If the driving future is dropped,
/// an arbitrary survivor is promoted and woken, so the group always has a
/// path forward as long as any waiter remains.
#[derive(Debug, Default)]
pub(crate) struct WaiterSet {
    slots: Vec<Option<Waker>>,
    driver: Option<usize>,
}

impl WaiterSet {
    /// Park a new waker, returning its token. The new waker becomes the
    /// driver.
    #[must_use]
    pub(crate) fn park(&mut self, waker: Waker) -> WaiterToken {
        let slot = self.slots.len();
        self.slots.push(Some(waker));
        self.driver = Some(slot);
        WaiterToken(slot)
    }

    /// Refresh the waker behind an existing token and make it the driver.
    /// The waker comes in by reference because it originates in a poll
    /// `Context` and needs cloning either way.
    ///
    /// Panics if the token's slot was already vacated; that would mean a
    /// future reused a token after abandoning it.
    pub(crate) fn repark(&mut self, token: &WaiterToken, waker: &Waker) {
        match self.slots.get_mut(token.0) {
            Some(Some(slot)) => slot.clone_from(waker),
            _ => panic!("reparked a waiter that is no longer in the set"),
        }
        self.driver = Some(token.0);
    }

    /// Wake the current driver, if any. Used when the key cap closes a
    /// window early and the group needs a poll to notice.
    pub(crate) fn wake_driver(&self) {
        if let Some(Some(waker)) = self.driver.map(|slot| &self.slots[slot]) {
            waker.wake_by_ref();
        }
    }

    /// Remove a waiter whose future is going away mid-flight. If it was the
    /// driver (or no driver exists), a surviving waiter is promoted and
    /// woken immediately, so that a burst of drops still leaves one awake
    /// task to carry the group forward.
    pub(crate) fn abandon(&mut self, token: WaiterToken) {
        if let Some(slot) = self.slots.get_mut(token.0) {
            *slot = None;
        }
        if self.driver == Some(token.0) || self.driver.is_none() {
            self.driver = None;
            let survivor = self
                .slots
                .iter()
                .enumerate()
                .find_map(|(slot, waker)| waker.as_ref().map(|waker| (slot, waker)));
            if let Some((slot, waker)) = survivor {
                self.driver = Some(slot);
                waker.wake_by_ref();
            }
        }
    }

    /// Wake every parked waiter. Consumes the set; used when the group
    /// reaches its terminal state.
    pub(crate) fn wake_all(self) {
        self.slots.into_iter().flatten().for_each(Waker::wake);
    }

    /// Wake every parked waiter except the one holding `token`, which is
    /// about to take its result directly and doesn't need the wakeup.
    pub(crate) fn wake_all_except(mut self, token: WaiterToken) {
        if let Some(slot) = self.slots.get_mut(token.0) {
            *slot = None;
        }
        self.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use cooked_waker::{IntoWaker, Wake, WakeRef};

    #[derive(Debug, Clone, Default, IntoWaker)]
    struct CountingWaker {
        count: Arc<AtomicUsize>,
    }

    impl CountingWaker {
        fn wakes(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl WakeRef for CountingWaker {
        fn wake_by_ref(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Wake for CountingWaker {}

    #[test]
    fn abandoned_driver_promotes_a_survivor() {
        let first = CountingWaker::default();
        let second = CountingWaker::default();

        let mut set = WaiterSet::default();
        let token1 = set.park(first.clone().into_waker());
        let token2 = set.park(second.clone().into_waker());

        // token2 parked last, so it is the driver; dropping it must wake
        // the remaining waiter.
        set.abandon(token2);
        assert_eq!(first.wakes(), 1);
        assert_eq!(second.wakes(), 0);

        // Dropping the last waiter wakes nobody.
        set.abandon(token1);
        assert_eq!(first.wakes(), 1);
    }

    #[test]
    fn abandoning_a_non_driver_is_silent() {
        let first = CountingWaker::default();
        let second = CountingWaker::default();

        let mut set = WaiterSet::default();
        let token1 = set.park(first.clone().into_waker());
        let _token2 = set.park(second.clone().into_waker());

        set.abandon(token1);
        assert_eq!(first.wakes(), 0);
        assert_eq!(second.wakes(), 0);
    }

    #[test]
    fn wake_all_except_skips_the_caller() {
        let first = CountingWaker::default();
        let second = CountingWaker::default();

        let mut set = WaiterSet::default();
        let _token1 = set.park(first.clone().into_waker());
        let token2 = set.park(second.clone().into_waker());

        set.wake_all_except(token2);
        assert_eq!(first.wakes(), 1);
        assert_eq!(second.wakes(), 0);
    }
}
