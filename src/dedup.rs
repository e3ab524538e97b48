//! Salted-hash deduplication store.
//!
//! Raw device addresses never leave the scan callback: each one is folded
//! with the current window's salt into a 16-bit [`fingerprint`] and only
//! that is kept. Rotating the salt at every window boundary makes the same
//! device hash to an unrelated fingerprint in the next window.
//!
//! Storage is one [`FingerprintSet`] per [`Category`], a bitset spanning
//! the whole 16-bit fingerprint space. Inserts are O(1) and can never run
//! out of room, so the scan callback can call [`DedupStore::observe`]
//! from its restricted context without any failure path.

use core::cell::RefCell;

use critical_section::Mutex;

/// Number of u64 words needed for one bit per 16-bit fingerprint.
const SET_WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Device category counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Wifi,
    Ble,
}

impl Category {
    pub const COUNT: usize = 2;
    pub const ALL: [Category; Category::COUNT] = [Category::Wifi, Category::Ble];

    #[inline]
    fn index(self) -> usize {
        match self {
            Category::Wifi => 0,
            Category::Ble => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Wifi => "wifi",
            Category::Ble => "ble",
        }
    }
}

/// Salted 16-bit hash of a 6-byte device address.
///
/// Pure function of `(raw, salt)`; never fails. Salt and address fill one
/// 64-bit word that goes through the MurmurHash3 finalizer, then the four
/// 16-bit lanes are folded together. The multiplications keep it
/// non-linear in the salt: a new salt moves every device independently
/// and pairs that collide under one salt almost never collide under the
/// next.
pub fn fingerprint(raw: &[u8; 6], salt: u16) -> u16 {
    let [a, b, c, d, e, f] = *raw;
    let mut x = u64::from_be_bytes([0, 0, a, b, c, d, e, f]) | (salt as u64) << 48;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    (x ^ x >> 16 ^ x >> 32 ^ x >> 48) as u16
}

/// Source of fresh salts, normally the hardware RNG.
pub trait SaltSource {
    fn next_salt(&mut self) -> u16;
}

impl<F: FnMut() -> u16> SaltSource for F {
    fn next_salt(&mut self) -> u16 {
        self()
    }
}

/// Set of fingerprints, one bit each. 8 KiB.
pub struct FingerprintSet {
    bits: [u64; SET_WORDS],
    len: u32,
}

impl FingerprintSet {
    pub const fn new() -> Self {
        Self {
            bits: [0; SET_WORDS],
            len: 0,
        }
    }

    /// Insert a fingerprint. Returns `true` if it was not present.
    #[inline]
    pub fn insert(&mut self, fp: u16) -> bool {
        let word = &mut self.bits[fp as usize / 64];
        let mask = 1u64 << (fp % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.len += 1;
        true
    }

    #[inline]
    pub fn contains(&self, fp: u16) -> bool {
        (self.bits[fp as usize / 64] >> (fp % 64)) & 1 == 1
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.bits = [0; SET_WORDS];
        self.len = 0;
    }
}

impl Default for FingerprintSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Distinct-device counts for one counting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub wifi: u32,
    pub ble: u32,
}

impl Counts {
    pub fn get(&self, category: Category) -> u32 {
        match category {
            Category::Wifi => self.wifi,
            Category::Ble => self.ble,
        }
    }

    pub fn total(&self) -> u32 {
        self.wifi.saturating_add(self.ble)
    }
}

struct Window {
    salt: u16,
    sets: [FingerprintSet; Category::COUNT],
}

impl Window {
    fn counts(&self) -> Counts {
        Counts {
            wifi: self.sets[Category::Wifi.index()].len(),
            ble: self.sets[Category::Ble.index()].len(),
        }
    }

    fn restart(&mut self, candidate: u16) {
        // A window must never reuse the previous salt.
        self.salt = if candidate == self.salt {
            candidate.wrapping_add(1)
        } else {
            candidate
        };
        for set in self.sets.iter_mut() {
            set.clear();
        }
    }
}

/// Per-category fingerprint sets plus the salt of the current window.
///
/// Every operation runs inside one critical section, so an `observe`
/// racing a window boundary is linearized either before it (old window,
/// old salt) or after it (new window, new salt), never both or neither.
pub struct DedupStore {
    window: Mutex<RefCell<Window>>,
}

impl DedupStore {
    pub const fn new() -> Self {
        Self {
            window: Mutex::new(RefCell::new(Window {
                salt: 0,
                sets: [FingerprintSet::new(), FingerprintSet::new()],
            })),
        }
    }

    /// Record a device seen by the scan path. Returns `true` if it is new
    /// in the current window. Safe from the scan callback's context.
    pub fn observe(&self, category: Category, raw: &[u8; 6]) -> bool {
        critical_section::with(|cs| {
            let mut window = self.window.borrow_ref_mut(cs);
            let fp = fingerprint(raw, window.salt);
            window.sets[category.index()].insert(fp)
        })
    }

    /// Distinct devices of `category` seen in the current window.
    pub fn drain(&self, category: Category) -> u32 {
        critical_section::with(|cs| self.window.borrow_ref(cs).sets[category.index()].len())
    }

    /// Snapshot of every category without resetting.
    pub fn counts(&self) -> Counts {
        critical_section::with(|cs| self.window.borrow_ref(cs).counts())
    }

    /// Start a new counting window: clear every category and install a
    /// fresh salt.
    pub fn reset_window(&self, salts: &mut impl SaltSource) {
        let candidate = salts.next_salt();
        critical_section::with(|cs| self.window.borrow_ref_mut(cs).restart(candidate));
    }

    /// Read every category and start a new window in one step. Nothing
    /// observed concurrently can fall between the read and the reset.
    pub fn close_window(&self, salts: &mut impl SaltSource) -> Counts {
        let candidate = salts.next_salt();
        critical_section::with(|cs| {
            let mut window = self.window.borrow_ref_mut(cs);
            let counts = window.counts();
            window.restart(candidate);
            counts
        })
    }

    pub fn salt(&self) -> u16 {
        critical_section::with(|cs| self.window.borrow_ref(cs).salt)
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}
