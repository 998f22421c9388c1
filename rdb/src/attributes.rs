// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{Afi, PathAttributeList};
use std::collections::HashSet;
use std::sync::Arc;

/// Hash-consing store for path attribute lists. Routes hold an `Arc` to the
/// interned list; the manager holds one more. A list whose only remaining
/// reference is the manager's own is dropped on the next `sweep`.
pub struct AttributeManager<A: Afi> {
    lists: HashSet<Arc<PathAttributeList<A>>>,
}

impl<A: Afi> Default for AttributeManager<A> {
    fn default() -> Self {
        Self {
            lists: HashSet::new(),
        }
    }
}

impl<A: Afi> AttributeManager<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `attrs`, creating it on first use.
    pub fn intern(
        &mut self,
        attrs: PathAttributeList<A>,
    ) -> Arc<PathAttributeList<A>> {
        if let Some(existing) = self.lists.get(&attrs) {
            return existing.clone();
        }
        let attrs = Arc::new(attrs);
        self.lists.insert(attrs.clone());
        attrs
    }

    /// Drop every list no route references any more. Returns how many were
    /// released.
    pub fn sweep(&mut self) -> usize {
        let before = self.lists.len();
        self.lists.retain(|a| Arc::strong_count(a) > 1);
        before - self.lists.len()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}
