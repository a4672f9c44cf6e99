//! Standard security handler, revision 3 (RC4, 128-bit key).
//!
//! Owner and user passwords are the same value. Every stream is encrypted
//! with an object key derived from the document key, object number and
//! generation.

/// Password padding string from the standard security handler.
const PAD: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

/// Key length in bytes (128 bits).
const KEY_LEN: usize = 16;

/// Permission flags: everything allowed.
pub const PERMISSIONS: i32 = -4;

/// Derived encryption state for one document.
#[derive(Clone)]
pub struct Security {
    key: [u8; KEY_LEN],
    owner_entry: [u8; 32],
    user_entry: [u8; 32],
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Security").finish_non_exhaustive()
    }
}

impl Security {
    /// Derives the `/O` and `/U` entries and the document key.
    #[must_use]
    pub fn new(password: &str, file_id: &[u8]) -> Self {
        let padded = pad_password(password);
        let owner_entry = owner_entry(&padded, &padded);
        let key = document_key(&padded, &owner_entry, file_id);
        let user_entry = user_entry(&key, file_id);
        Self {
            key,
            owner_entry,
            user_entry,
        }
    }

    /// Encrypts (or decrypts) `data` belonging to object `id`, generation 0.
    #[must_use]
    pub fn apply(&self, id: u32, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        Rc4::new(&self.object_key(id)).apply(&mut out);
        out
    }

    /// Body of the `/Encrypt` dictionary.
    #[must_use]
    pub fn dictionary(&self) -> String {
        format!(
            "<< /Filter /Standard /V 2 /R 3 /Length 128 /O <{}> /U <{}> /P {PERMISSIONS} >>",
            crate::cache::hex(&self.owner_entry),
            crate::cache::hex(&self.user_entry)
        )
    }

    fn object_key(&self, id: u32) -> [u8; KEY_LEN] {
        let mut ctx = md5::Context::new();
        ctx.consume(self.key);
        ctx.consume(&id.to_le_bytes()[..3]);
        ctx.consume([0u8, 0u8]);
        ctx.compute().0
    }
}

fn pad_password(password: &str) -> [u8; 32] {
    let mut out = PAD;
    let bytes = password.as_bytes();
    let n = bytes.len().min(32);
    out[..n].copy_from_slice(&bytes[..n]);
    out[n..].copy_from_slice(&PAD[..32 - n]);
    out
}

/// Algorithm 3: the `/O` entry.
fn owner_entry(owner: &[u8; 32], user: &[u8; 32]) -> [u8; 32] {
    let mut digest = md5::compute(owner).0;
    for _ in 0..50 {
        digest = md5::compute(digest).0;
    }

    let mut out = *user;
    rc4_rounds(&digest, &mut out);
    out
}

/// Algorithm 2: the document encryption key.
fn document_key(user: &[u8; 32], owner_entry: &[u8; 32], file_id: &[u8]) -> [u8; KEY_LEN] {
    let mut ctx = md5::Context::new();
    ctx.consume(user);
    ctx.consume(owner_entry);
    ctx.consume(PERMISSIONS.to_le_bytes());
    ctx.consume(file_id);
    let mut key = ctx.compute().0;
    for _ in 0..50 {
        key = md5::compute(key).0;
    }
    key
}

/// Algorithm 5: the `/U` entry.
fn user_entry(key: &[u8; KEY_LEN], file_id: &[u8]) -> [u8; 32] {
    let mut ctx = md5::Context::new();
    ctx.consume(PAD);
    ctx.consume(file_id);
    let mut hash = ctx.compute().0;
    rc4_rounds(key, &mut hash);

    let mut out = [0u8; 32];
    out[..KEY_LEN].copy_from_slice(&hash);
    out
}

/// RC4 with `key`, then 19 more passes with `key ^ i`.
fn rc4_rounds(key: &[u8; KEY_LEN], data: &mut [u8]) {
    Rc4::new(key).apply(data);
    for i in 1..=19u8 {
        let round_key: Vec<u8> = key.iter().map(|b| b ^ i).collect();
        Rc4::new(&round_key).apply(data);
    }
}

/// Minimal RC4 stream cipher.
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    #[allow(clippy::cast_possible_truncation)]
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (n, slot) in state.iter_mut().enumerate() {
            *slot = n as u8;
        }
        let mut j: u8 = 0;
        for n in 0..256 {
            j = j
                .wrapping_add(state[n])
                .wrapping_add(key[n % key.len()]);
            state.swap(n, usize::from(j));
        }
        Self { state, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[usize::from(self.i)]);
            self.state.swap(usize::from(self.i), usize::from(self.j));
            let k = self.state
                [usize::from(self.state[usize::from(self.i)].wrapping_add(self.state[usize::from(self.j)]))];
            *byte ^= k;
        }
    }
}
