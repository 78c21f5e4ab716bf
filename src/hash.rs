/// Robert Jenkins' hash implementation for CRUSH
/// This is the OLD Jenkins hash (not the lookup3 version)
/// Reference: ~/dev/ceph/src/crush/hash.c
///
/// IMPORTANT: This is the rjenkins1 hash from Ceph, which uses the
/// old crush_hashmix macro. It's different from Bob Jenkins' later
/// lookup3.c hash function.
/// Hash seed used by Ceph's CRUSH
const CRUSH_HASH_SEED: u32 = 1315423911;

/// Old Jenkins hash mix function
/// This is the crush_hashmix macro from ~/dev/ceph/src/crush/hash.c
#[inline]
fn crush_hashmix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*b);
    *a = a.wrapping_sub(*c);
    *a ^= *c >> 13;

    *b = b.wrapping_sub(*c);
    *b = b.wrapping_sub(*a);
    *b ^= *a << 8;

    *c = c.wrapping_sub(*a);
    *c = c.wrapping_sub(*b);
    *c ^= *b >> 13;

    *a = a.wrapping_sub(*b);
    *a = a.wrapping_sub(*c);
    *a ^= *c >> 12;

    *b = b.wrapping_sub(*c);
    *b = b.wrapping_sub(*a);
    *b ^= *a << 16;

    *c = c.wrapping_sub(*a);
    *c = c.wrapping_sub(*b);
    *c ^= *b >> 5;

    *a = a.wrapping_sub(*b);
    *a = a.wrapping_sub(*c);
    *a ^= *c >> 3;

    *b = b.wrapping_sub(*c);
    *b = b.wrapping_sub(*a);
    *b ^= *a << 10;

    *c = c.wrapping_sub(*a);
    *c = c.wrapping_sub(*b);
    *c ^= *b >> 15;
}

/// Hash a single 32-bit value using rjenkins1
pub fn crush_hash32(mut a: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a;
    let mut b = a;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut b, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut a, &mut hash);

    hash
}

/// Hash two 32-bit values using rjenkins1
pub fn crush_hash32_2(mut a: u32, mut b: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut x, &mut a, &mut hash);
    crush_hashmix(&mut b, &mut y, &mut hash);

    hash
}

/// Hash three 32-bit values using rjenkins1
pub fn crush_hash32_3(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b ^ c;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut a, &mut hash);
    crush_hashmix(&mut b, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut c, &mut hash);

    hash
}

/// Hash four 32-bit values using rjenkins1
pub fn crush_hash32_4(mut a: u32, mut b: u32, mut c: u32, mut d: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b ^ c ^ d;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut d, &mut hash);
    crush_hashmix(&mut a, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut d, &mut hash);

    hash
}

/// Hash five 32-bit values using rjenkins1
pub fn crush_hash32_5(mut a: u32, mut b: u32, mut c: u32, mut d: u32, mut e: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b ^ c ^ d ^ e;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut d, &mut hash);
    crush_hashmix(&mut e, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut a, &mut hash);
    crush_hashmix(&mut b, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut c, &mut hash);
    crush_hashmix(&mut d, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut e, &mut hash);

    hash
}
