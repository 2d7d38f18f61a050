#![no_main]

use libfuzzer_sys::fuzz_target;
use tilec_ir::{Swizzle, SwizzleKind};

fuzz_target!(|data: &[u8]| {
    let [kind, bits, base, shift, rest @ ..] = data else {
        return;
    };
    let kind = match kind % 3 {
        0 => SwizzleKind::Xor,
        1 => SwizzleKind::Rotate,
        _ => SwizzleKind::RotateInverse,
    };
    let Ok(swizzle) = Swizzle::new(kind, u32::from(*bits % 8), u32::from(*base % 8), u32::from(*shift % 12)) else {
        return;
    };
    let inverse = swizzle.inverse();
    for chunk in rest.chunks(4) {
        let mut raw = [0u8; 4];
        raw[..chunk.len()].copy_from_slice(chunk);
        let offset = u64::from(u32::from_le_bytes(raw));
        assert_eq!(inverse.apply(swizzle.apply(offset)), offset);
    }
});
