/// Generate a lowercase ASCII name from an index.
///
/// # Examples
/// ```
/// # use canvas::utils::ascii_name;
/// assert_eq!(ascii_name(0), "a");
/// assert_eq!(ascii_name(25), "z");
/// assert_eq!(ascii_name(26), "aa");
/// assert_eq!(ascii_name(27), "ab");
/// assert_eq!(ascii_name(26*26 + 26), "aaa");
/// ```
pub fn ascii_name(idx: usize) -> String {
    let mut n = idx
        .checked_add(1)
        .expect("index too large for bijective base-26");
    let mut characters: Vec<u8> = Vec::with_capacity(3);
    while n > 0 {
        let q = (n - 1) / 26;
        let r = ((n - 1) % 26) as u8;
        characters.push(b'a' + r);
        n = q;
    }
    characters.reverse();
    String::from_utf8(characters).expect("generated only ASCII")
}

/// Returns the factors of an integer, in ascending order.
pub fn factors(x: u64) -> Vec<u64> {
    let mut result = Vec::new();
    let mut i = 1;
    while i * i <= x {
        if x % i == 0 {
            result.push(i);
            if x / i != i {
                result.push(x / i);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

pub const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Mixes two 64-bit digests. Not commutative.
pub const fn hash_combine(seed: u64, value: u64) -> u64 {
    // splitmix64 finalizer over the combined words
    let mut z = seed
        .rotate_left(5)
        .wrapping_add(value)
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}
