//! Benchmarks for the per-function decompilation pipeline.
//!
//! Synthetic functions built from repeated countdown loops, from decoding
//! through structuring and rendering.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dc_decompiler::decompiler::{
    decompile_instructions, ConstantPool, Instruction, Opcode, ReconstructOptions, RenderOptions, Syntax,
};
use dc_decompiler::SidResolver;
use std::hint::black_box;

/// `loops` 個のカウントダウンループを並べた関数
fn countdown_chain(loops: usize) -> Vec<Instruction> {
    let mut instructions = Vec::with_capacity(loops * 6 + 1);
    for index in 0..loops {
        let base = (index * 6) as u8;
        instructions.extend([
            Instruction::new(Opcode::LoadU16Imm, 0, 3, 0),
            Instruction::new(Opcode::LoadU16Imm, 1, 0, 0),
            Instruction::new(Opcode::IGreaterThan, 2, 0, 1),
            Instruction::new(Opcode::BranchIfNot, base + 6, 2, 0),
            Instruction::new(Opcode::ISubImm, 0, 0, 1),
            Instruction::new(Opcode::Branch, base + 1, 0, 0),
        ]);
    }
    instructions.push(Instruction::new(Opcode::Return, 0, 0, 0));
    instructions
}

fn bench_decompile(c: &mut Criterion) {
    let resolver = SidResolver::new();
    let options = ReconstructOptions::default();
    let mut group = c.benchmark_group("decompile");
    for loops in [1usize, 8, 32] {
        let instructions = countdown_chain(loops);
        group.bench_with_input(BenchmarkId::from_parameter(loops), &instructions, |b, instructions| {
            b.iter(|| {
                let function = decompile_instructions(
                    "bench",
                    black_box(instructions),
                    ConstantPool::default(),
                    &resolver,
                    &options,
                )
                .unwrap();
                black_box(function)
            });
        });
    }
    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let resolver = SidResolver::new();
    let function = decompile_instructions(
        "bench",
        &countdown_chain(32),
        ConstantPool::default(),
        &resolver,
        &ReconstructOptions::default(),
    )
    .unwrap();

    for syntax in [Syntax::C, Syntax::Racket] {
        let options = RenderOptions {
            syntax,
            ..RenderOptions::default()
        };
        c.bench_function(&format!("render_{}", syntax), |b| {
            b.iter(|| black_box(function.render(&resolver, black_box(&options))));
        });
    }
}

criterion_group!(benches, bench_decompile, bench_render);
criterion_main!(benches);
