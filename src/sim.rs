//! In-process simulation world.
//!
//! Stands in for the external collaborators during tests and demos: a
//! launcher KVS with a real barrier, a symmetric allocator, and rendezvous
//! collectives over explicit active sets. One `SimWorld` hosts `npes`
//! "processes" that are really threads; each thread takes its per-PE
//! handles from [`SimWorld::pe`].

use crate::collectives::{
    ActiveSet, CollectiveError, Collectives, PsyncRef, SymHandle, SymmetricHeap,
};
use crate::runtime::{KvsError, RuntimeKvs};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MeetKind {
    KvsBarrier,
    Reduce,
    Barrier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MeetKey {
    kind: MeetKind,
    set: ActiveSet,
    scratch: PsyncRef,
}

/// One rendezvous point. Rounds are generation-counted and arrivals are
/// tracked per PE, so a fast PE re-entering the same rendezvous waits for
/// the current round to finish instead of being counted twice.
struct Meet {
    state: Mutex<MeetState>,
    cv: Condvar,
}

struct MeetState {
    arrived: HashSet<usize>,
    acc: u64,
    generation: u64,
    /// generation -> (result, readers still owed it)
    results: HashMap<u64, (u64, usize)>,
}

impl Meet {
    fn new() -> Self {
        Meet {
            state: Mutex::new(MeetState {
                arrived: HashSet::new(),
                acc: u64::MAX,
                generation: 0,
                results: HashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    fn arrive(&self, pe: usize, size: usize, contribution: Option<u64>) -> u64 {
        let mut st = self.state.lock().unwrap();

        while st.arrived.contains(&pe) {
            st = self.cv.wait(st).unwrap();
        }

        st.arrived.insert(pe);
        if let Some(v) = contribution {
            st.acc &= v;
        }
        let my_gen = st.generation;

        if st.arrived.len() == size {
            let result = st.acc;
            if size > 1 {
                st.results.insert(my_gen, (result, size - 1));
            }
            st.arrived.clear();
            st.acc = u64::MAX;
            st.generation += 1;
            self.cv.notify_all();
            result
        } else {
            while st.generation == my_gen {
                st = self.cv.wait(st).unwrap();
            }
            let (result, left) = {
                let entry = st.results.get_mut(&my_gen).unwrap();
                entry.1 -= 1;
                (entry.0, entry.1)
            };
            if left == 0 {
                st.results.remove(&my_gen);
            }
            result
        }
    }
}

struct SimShared {
    npes: usize,
    local_size: usize,
    kvs: Mutex<HashMap<(usize, String), Vec<u8>>>,
    meets: Mutex<HashMap<MeetKey, Arc<Meet>>>,
}

impl SimShared {
    fn meet(&self, key: MeetKey) -> Arc<Meet> {
        let mut meets = self.meets.lock().unwrap();
        Arc::clone(meets.entry(key).or_insert_with(|| Arc::new(Meet::new())))
    }
}

#[derive(Clone)]
pub struct SimWorld {
    shared: Arc<SimShared>,
}

impl SimWorld {
    pub fn new(npes: usize) -> Self {
        assert!(npes > 0);
        SimWorld {
            shared: Arc::new(SimShared {
                npes,
                local_size: npes,
                kvs: Mutex::new(HashMap::new()),
                meets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn npes(&self) -> usize {
        self.shared.npes
    }

    /// Per-PE external collaborator handles.
    pub fn pe(&self, pe: usize) -> SimPe {
        assert!(pe < self.shared.npes);
        SimPe {
            kvs: Arc::new(SimKvs { shared: Arc::clone(&self.shared), pe }),
            heap: Arc::new(SimHeap { next: AtomicU64::new(0) }),
            collectives: Arc::new(SimCollectives { shared: Arc::clone(&self.shared), pe }),
        }
    }
}

pub struct SimPe {
    pub kvs: Arc<SimKvs>,
    pub heap: Arc<SimHeap>,
    pub collectives: Arc<SimCollectives>,
}

pub struct SimKvs {
    shared: Arc<SimShared>,
    pe: usize,
}

impl RuntimeKvs for SimKvs {
    fn rank(&self) -> usize {
        self.pe
    }

    fn size(&self) -> usize {
        self.shared.npes
    }

    fn local_size(&self) -> usize {
        self.shared.local_size
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvsError> {
        self.shared
            .kvs
            .lock()
            .unwrap()
            .insert((self.pe, key.to_string()), value.to_vec());
        Ok(())
    }

    fn barrier(&self) -> Result<(), KvsError> {
        let key = MeetKey {
            kind: MeetKind::KvsBarrier,
            set: ActiveSet { start: 0, stride: 1, size: self.shared.npes },
            scratch: PsyncRef { handle: SymHandle(u64::MAX), offset_words: 0 },
        };
        self.shared.meet(key).arrive(self.pe, self.shared.npes, None);
        Ok(())
    }

    fn get(&self, pe: usize, key: &str, len: usize) -> Result<Vec<u8>, KvsError> {
        let map = self.shared.kvs.lock().unwrap();
        let value = map
            .get(&(pe, key.to_string()))
            .ok_or_else(|| KvsError::Missing(key.to_string(), pe))?;
        if value.len() != len {
            return Err(KvsError::LengthMismatch {
                key: key.to_string(),
                pe,
                expected: len,
                actual: value.len(),
            });
        }
        Ok(value.clone())
    }
}

/// Symmetric allocator: every PE performs the same allocation sequence, so
/// a per-PE monotonic counter yields identical handles on all PEs.
pub struct SimHeap {
    next: AtomicU64,
}

impl SymmetricHeap for SimHeap {
    fn alloc_words(&self, count: usize, _fill: i64) -> Result<SymHandle, CollectiveError> {
        if count == 0 {
            return Err(CollectiveError::Failed("zero-length symmetric alloc".into()));
        }
        Ok(SymHandle(self.next.fetch_add(1, Ordering::SeqCst)))
    }
}

pub struct SimCollectives {
    shared: Arc<SimShared>,
    pe: usize,
}

impl Collectives for SimCollectives {
    fn and_reduce_u64(
        &self,
        set: ActiveSet,
        value: u64,
        scratch: PsyncRef,
    ) -> Result<u64, CollectiveError> {
        if !set.contains(self.pe) {
            return Err(CollectiveError::Failed(format!(
                "pe {} reduced outside its active set",
                self.pe
            )));
        }
        let key = MeetKey { kind: MeetKind::Reduce, set, scratch };
        Ok(self.shared.meet(key).arrive(self.pe, set.size, Some(value)))
    }

    fn barrier(&self, set: ActiveSet, scratch: PsyncRef) -> Result<(), CollectiveError> {
        if !set.contains(self.pe) {
            return Err(CollectiveError::Failed(format!(
                "pe {} barriered outside its active set",
                self.pe
            )));
        }
        let key = MeetKey { kind: MeetKind::Barrier, set, scratch };
        self.shared.meet(key).arrive(self.pe, set.size, None);
        Ok(())
    }
}
