//! Benchmarks for checks elimination and the analyses behind it

use compiler::config::OptimizerConfig;
use compiler::ir::alias_analysis::AliasAnalysis;
use compiler::ir::bounds_analysis::BoundsRangeInfo;
use compiler::ir::checks_elimination::ChecksElimination;
use compiler::ir::optimization::{OptimizationPass, PassManager};
use compiler::ir::{ConditionCode, DataType, IrBuilder, IrFunction, Opcode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// `loops` sequential loops over `a`, each reading `a[i + k]` for
/// `k in 0..accesses` and storing the sum into a field.
fn generate_array_loops(loops: usize, accesses: usize) -> IrFunction {
    let mut b = IrBuilder::new("bench");
    let a = b.parameter(0, DataType::Reference);
    let n = b.parameter(1, DataType::Int32);
    let out = b.parameter(2, DataType::Reference);
    let ss = b.save_state(&[a, n, out]);
    let nc = b.null_check(a, ss);
    let len = b.len_array(nc);
    let zero = b.constant_typed(0, DataType::Int32);

    for l in 0..loops {
        let bound = if l % 2 == 0 { len } else { n };
        let lp = b.begin_counted_loop(zero, bound, ConditionCode::Lt, 1);
        let body_ss = b.save_state(&[a, lp.index]);
        let mut sum = zero;
        for k in 0..accesses {
            let offset = b.constant_typed(k as i64, DataType::Int32);
            let idx = b.binary(Opcode::Add, DataType::Int32, lp.index, offset);
            let checked = b.bounds_check(len, idx, body_ss);
            let elem = b.load_array(nc, checked, DataType::Int32);
            sum = b.binary(Opcode::Add, DataType::Int32, sum, elem);
        }
        b.store_array(out, lp.index, sum);
        b.end_counted_loop(&lp);
    }
    b.ret(None);
    b.finish()
}

fn benchmark_checks_elimination(c: &mut Criterion) {
    let mut group = c.benchmark_group("checks_elimination");

    for loops in [1, 8, 32] {
        let func = generate_array_loops(loops, 4);
        group.bench_with_input(BenchmarkId::from_parameter(loops), &func, |b, func| {
            b.iter(|| {
                let mut func = func.clone();
                let result = ChecksElimination::default().run_on_function(&mut func);
                black_box(result);
            });
        });
    }

    group.finish();
}

fn benchmark_analyses(c: &mut Criterion) {
    let func = generate_array_loops(16, 4);

    c.bench_function("bounds_range_info", |b| {
        b.iter(|| black_box(BoundsRangeInfo::compute(black_box(&func))));
    });

    c.bench_function("alias_analysis", |b| {
        b.iter(|| {
            let mut alias = AliasAnalysis::new(black_box(&func));
            black_box(alias.run());
        });
    });
}

fn benchmark_default_pipeline(c: &mut Criterion) {
    let func = generate_array_loops(16, 4);
    let manager = PassManager::from_config(&OptimizerConfig::default()).unwrap();

    c.bench_function("default_pipeline", |b| {
        b.iter(|| {
            let mut func = func.clone();
            black_box(manager.run_function(&mut func).unwrap());
        });
    });
}

criterion_group!(
    benches,
    benchmark_checks_elimination,
    benchmark_analyses,
    benchmark_default_pipeline
);

criterion_main!(benches);
