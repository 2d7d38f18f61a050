#![no_main]

use libfuzzer_sys::fuzz_target;
use tilec_ir::{BinaryOp, Buffer, Kernel, Operand, Scalar, Scope, TileOp};
use tilec_opt::CompileOptions;

const SCOPES: [Scope; 4] = [Scope::Global, Scope::Shared, Scope::Local, Scope::Fragment];

fuzz_target!(|data: &[u8]| {
    // Random copy/elementwise DAGs over a handful of 16x16 buffers; lowering
    // may reject them but must never panic.
    let mut k = Kernel::new("fuzz");
    let mut buffers = Vec::new();
    for (i, &b) in data.iter().take(6).enumerate() {
        let dtype = if b & 4 == 0 { Scalar::F16 } else { Scalar::F32 };
        let scope = SCOPES[usize::from(b % 4)];
        match k.add_buffer(Buffer::new(format!("b{i}"), vec![16, 16], dtype, scope)) {
            Ok(h) => buffers.push(h),
            Err(_) => return,
        }
    }
    if buffers.len() < 2 {
        return;
    }

    let mut ops = Vec::new();
    for (i, pair) in data.get(6..).unwrap_or_default().chunks(3).enumerate() {
        let pick = |x: u8| buffers[usize::from(x) % buffers.len()];
        let op = match pair {
            [x, y] => TileOp::copy(format!("op{i}"), Operand::whole(pick(*x)), Operand::whole(pick(*y))),
            [x, y, z] => TileOp::elementwise(
                format!("op{i}"),
                BinaryOp::Add,
                Operand::whole(pick(*x)),
                Operand::whole(pick(*y)),
                Operand::whole(pick(*z)),
            ),
            _ => continue,
        };
        let Ok(h) = k.add_op(op) else { continue };
        if k.push(h).is_err() {
            return;
        }
        if let Some(&prev) = ops.last() {
            let _ = k.add_dependency(h, prev);
        }
        ops.push(h);
    }

    let _ = tilec_opt::lower(&mut k, &CompileOptions::default());
});
