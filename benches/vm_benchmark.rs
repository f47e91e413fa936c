//! VM performance benchmarks over hand-assembled bytecode units.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use conch::vm::{BytecodeUnit, ConstantPool, Function};
use conch::{Interpreter, Op, RuntimeConfig};

struct Asm {
    code: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Self { code: Vec::new() }
    }

    fn op(&mut self, op: Op) -> &mut Self {
        self.code.push(op.encode());
        self
    }

    fn push_int(&mut self, value: i64) -> &mut Self {
        self.op(Op::PushInt);
        self.code.extend_from_slice(&(value as u64).to_be_bytes());
        self
    }

    fn with_u32(&mut self, op: Op, immediate: u32) -> &mut Self {
        self.op(op);
        self.code.extend_from_slice(&immediate.to_be_bytes());
        self
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn patch_u32(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.code[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }
}

/// `sum(n)`: a tight counting loop over locals and integer arithmetic.
fn sum_loop_unit(n: i64) -> (Vec<Function>, Vec<String>) {
    let mut asm = Asm::new();
    asm.push_int(0).with_u32(Op::SetQWord, 8);
    asm.push_int(1).with_u32(Op::SetQWord, 0);

    let loop_start = asm.here();
    asm.with_u32(Op::GetQWord, 0).push_int(n).op(Op::IntLe);
    let exit_patch = asm.here() + 1;
    asm.with_u32(Op::IfNotJump, 0);

    asm.with_u32(Op::GetQWord, 8)
        .with_u32(Op::GetQWord, 0)
        .op(Op::IntAdd)
        .with_u32(Op::SetQWord, 8);
    asm.with_u32(Op::GetQWord, 0)
        .push_int(1)
        .op(Op::IntAdd)
        .with_u32(Op::SetQWord, 0);
    asm.with_u32(Op::Jump, loop_start);

    let exit = asm.here();
    asm.patch_u32(exit_patch, exit);
    asm.with_u32(Op::GetQWord, 8).op(Op::Return);

    let main = Function {
        identifier: "bench::<main>".to_string(),
        locals_size: 16,
        parameters_byte_count: 0,
        return_byte_count: 8,
        instructions: asm.code,
    };
    (vec![main], vec!["bench::<main>".to_string()])
}

/// Recursive fib, exercising the invoke/return path.
fn fib_unit(n: i64) -> (Vec<Function>, Vec<String>) {
    let mut fib = Asm::new();
    fib.with_u32(Op::GetQWord, 0).push_int(2).op(Op::IntLt);
    let else_patch = fib.here() + 1;
    fib.with_u32(Op::IfNotJump, 0);
    fib.with_u32(Op::GetQWord, 0).op(Op::Return);

    let else_branch = fib.here();
    fib.patch_u32(else_patch, else_branch);
    fib.with_u32(Op::GetQWord, 0)
        .push_int(1)
        .op(Op::IntSub)
        .with_u32(Op::Invoke, 1);
    fib.with_u32(Op::GetQWord, 0)
        .push_int(2)
        .op(Op::IntSub)
        .with_u32(Op::Invoke, 1);
    fib.op(Op::IntAdd).op(Op::Return);

    let mut main = Asm::new();
    main.push_int(n).with_u32(Op::Invoke, 1).op(Op::Return);

    let functions = vec![
        Function {
            identifier: "bench::<main>".to_string(),
            locals_size: 8,
            parameters_byte_count: 0,
            return_byte_count: 8,
            instructions: main.code,
        },
        Function {
            identifier: "bench::fib".to_string(),
            locals_size: 8,
            parameters_byte_count: 8,
            return_byte_count: 8,
            instructions: fib.code,
        },
    ];
    (
        functions,
        vec!["bench::<main>".to_string(), "bench::fib".to_string()],
    )
}

fn run_unit(functions: Vec<Function>, constants: Vec<String>) -> i64 {
    let mut interpreter = Interpreter::new(&RuntimeConfig {
        call_stack_capacity: 64 * 1024,
        ..RuntimeConfig::default()
    });
    let pool = ConstantPool::new(
        constants
            .into_iter()
            .map(|constant| interpreter.heap_mut().alloc_string(constant))
            .collect(),
    );
    let unit = BytecodeUnit::new(pool, functions);
    let result = interpreter.run(&unit).expect("benchmark unit should run");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&result);
    i64::from_ne_bytes(buf)
}

fn bench_sum_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_loop");
    for n in [1_000i64, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let (functions, constants) = sum_loop_unit(n);
            b.iter(|| {
                let result = run_unit(functions.clone(), constants.clone());
                assert_eq!(black_box(result), n * (n + 1) / 2);
            });
        });
    }
    group.finish();
}

fn bench_fib(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib");
    for n in [15i64, 20] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let (functions, constants) = fib_unit(n);
            b.iter(|| {
                black_box(run_unit(functions.clone(), constants.clone()));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sum_loop, bench_fib);
criterion_main!(benches);
