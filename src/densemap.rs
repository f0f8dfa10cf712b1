//! A map of dense integer key to value, used for the node/command/rule arenas.

use std::marker::PhantomData;

pub trait Index: From<usize> + Copy {
    fn index(&self) -> usize;
}

/// Wraps a Vec<V> to provide typed keys; keys are handed out densely by push.
pub struct DenseMap<K, V> {
    vec: Vec<V>,
    key_type: PhantomData<K>,
}

impl<K: Index, V> DenseMap<K, V> {
    pub fn new() -> Self {
        DenseMap {
            vec: Vec::new(),
            key_type: PhantomData,
        }
    }

    pub fn get(&self, k: K) -> &V {
        &self.vec[k.index()]
    }

    pub fn get_mut(&mut self, k: K) -> &mut V {
        &mut self.vec[k.index()]
    }

    pub fn lookup(&self, k: K) -> Option<&V> {
        self.vec.get(k.index())
    }

    pub fn next_id(&self) -> K {
        K::from(self.vec.len())
    }

    pub fn push(&mut self, val: V) -> K {
        let id = self.next_id();
        self.vec.push(val);
        id
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }
}

impl<K: Index, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares an id type wrapping a usize, for use as a DenseMap key.
macro_rules! declare_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub usize);
        impl From<usize> for $name {
            fn from(n: usize) -> Self {
                $name(n)
            }
        }
        impl $crate::densemap::Index for $name {
            fn index(&self) -> usize {
                self.0
            }
        }
    };
}
pub(crate) use declare_id;
