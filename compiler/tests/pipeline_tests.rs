use compiler::config::OptimizerConfig;
use compiler::ir::checks_elimination::ChecksElimination;
use compiler::ir::dump::dump_function;
use compiler::ir::optimization::{create_pass, OptimizationEvent, OptimizationPass, PassManager};
use compiler::ir::{ConditionCode, DataType, DeoptimizeType, IrBuilder, IrFunction, IrModule, TypeId, Opcode};
use compiler::IrError;
use std::sync::{Arc, Mutex};

/// `let s = 0; for (let i = 0; i < a.length; i++) { s += a[i]; } return s;`
fn array_sum() -> IrFunction {
    let mut b = IrBuilder::new("array_sum");
    let a = b.parameter(0, DataType::Reference);
    let ss = b.save_state(&[a]);
    let nc = b.null_check(a, ss);
    let len = b.len_array(nc);
    let zero = b.constant_typed(0, DataType::Int32);
    let lp = b.begin_counted_loop(zero, len, ConditionCode::Lt, 1);

    b.switch_to_block(lp.header);
    let s = b.phi(DataType::Int32, &[zero]);
    b.switch_to_block(lp.body);
    let body_ss = b.save_state(&[a, s, lp.index]);
    let nc2 = b.null_check(a, body_ss);
    let len2 = b.len_array(nc2);
    let idx = b.bounds_check(len2, lp.index, body_ss);
    let elem = b.load_array(nc2, idx, DataType::Int32);
    let next = b.binary(Opcode::Add, DataType::Int32, s, elem);
    b.end_counted_loop(&lp);
    b.add_phi_input(s, next);
    b.ret(Some(s));
    b.finish()
}

/// Checks without loops: repeated null checks and constant-index
/// accesses to a fresh array.
fn straight_line() -> IrFunction {
    let mut b = IrBuilder::new("straight_line");
    let p = b.parameter(0, DataType::Reference);
    let ss = b.save_state(&[p]);
    let first = b.null_check(p, ss);
    let second = b.null_check(p, ss);
    let size = b.constant_typed(16, DataType::Int32);
    let arr = b.new_array(TypeId(1), size, ss);
    let len = b.len_array(arr);
    let three = b.constant_typed(3, DataType::Int32);
    let idx = b.bounds_check(len, three, ss);
    let value = b.load_array(arr, idx, DataType::Int32);
    b.store_object_dynamic(first, value, second);
    b.ret(None);
    b.finish()
}

/// `for (i = 0; i < n; i++) { use(a[i + 1]); use(a[i - 1]); }`
fn neighbours() -> IrFunction {
    let mut b = IrBuilder::new("neighbours");
    let a = b.parameter(0, DataType::Reference);
    let n = b.parameter(1, DataType::Int32);
    let ss = b.save_state(&[a, n]);
    let nc = b.null_check(a, ss);
    let len = b.len_array(nc);
    let zero = b.constant_typed(0, DataType::Int32);
    let one = b.constant_typed(1, DataType::Int32);
    let lp = b.begin_counted_loop(zero, n, ConditionCode::Lt, 1);
    let body_ss = b.save_state(&[a, lp.index]);
    let up = b.binary(Opcode::Add, DataType::Int32, lp.index, one);
    let down = b.binary(Opcode::Sub, DataType::Int32, lp.index, one);
    let c1 = b.bounds_check(len, up, body_ss);
    let x = b.load_array(nc, c1, DataType::Int32);
    let c2 = b.bounds_check(len, down, body_ss);
    let y = b.load_array(nc, c2, DataType::Int32);
    b.call_static(7, DataType::Void, &[x, y]);
    b.end_counted_loop(&lp);
    b.ret(None);
    b.finish()
}

fn count(function: &IrFunction, pred: impl Fn(Opcode) -> bool) -> usize {
    function.live_insts().filter(|i| pred(i.opcode)).count()
}

fn is_bounds_check(op: Opcode) -> bool {
    op == Opcode::BoundsCheck
}

fn is_guard(op: Opcode) -> bool {
    matches!(op, Opcode::DeoptimizeIf(_))
}

fn verifying_pipeline() -> PassManager {
    let config = OptimizerConfig {
        verify: true,
        ..OptimizerConfig::default()
    };
    PassManager::from_config(&config).unwrap()
}

#[test]
fn test_array_sum_loses_every_bounds_check() {
    let mut func = array_sum();
    assert_eq!(count(&func, is_bounds_check), 1);

    let result = verifying_pipeline().run_function(&mut func).unwrap();
    assert!(result.modified);
    assert_eq!(count(&func, is_bounds_check), 0);
    assert_eq!(count(&func, is_guard), 0);
    assert!(func.verify().is_ok());
}

#[test]
fn test_checks_elimination_is_idempotent() {
    for mut func in [array_sum(), straight_line()] {
        let pass = ChecksElimination::default();
        pass.run_on_function(&mut func);
        let before = dump_function(&func);
        let second = pass.run_on_function(&mut func);
        assert!(!second.modified, "second run changed @{}", func.name);
        assert!(second.events.is_empty());
        assert_eq!(dump_function(&func), before);
    }
}

#[test]
fn test_neighbour_checks_share_one_guard_pair() {
    let mut func = neighbours();
    let result = ChecksElimination::default().run_on_function(&mut func);
    assert_eq!(count(&func, is_bounds_check), 0);
    assert_eq!(count(&func, |op| op == Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck)), 2);
    assert_eq!(result.stats.get("guards_inserted"), Some(&2));

    // a[i - 1] fails on the first iteration, so the pair goes in front of
    // the first access instead of the preheader.
    let body = func
        .live_insts()
        .find(|i| i.opcode == Opcode::LoadArray)
        .map(|i| func.block_of(i.id))
        .unwrap();
    let order: Vec<Opcode> = func
        .block(body)
        .instructions
        .iter()
        .map(|&id| func.opcode(id))
        .filter(|op| matches!(op, Opcode::Compare(_) | Opcode::DeoptimizeIf(_) | Opcode::LoadArray))
        .collect();
    assert_eq!(
        order,
        vec![
            Opcode::Compare(ConditionCode::Lt),
            Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck),
            Opcode::Compare(ConditionCode::Ge),
            Opcode::DeoptimizeIf(DeoptimizeType::BoundsCheck),
            Opcode::LoadArray,
            Opcode::LoadArray,
        ]
    );
    assert!(func.verify().is_ok());
}

#[test]
fn test_events_reach_the_writer() {
    let seen: Arc<Mutex<Vec<OptimizationEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut manager = verifying_pipeline();
    manager.set_event_writer(Box::new(move |event: &OptimizationEvent| {
        sink.lock().unwrap().push(event.clone());
    }));
    let mut func = array_sum();
    let result = manager.run_function(&mut func).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, result.events);
    assert!(seen
        .iter()
        .any(|e| e.pass == "checks-elimination" && e.name.contains("BoundsCheck")));
}

#[test]
fn test_module_round_trips_through_json() {
    let mut module = IrModule::new("demo");
    module.add_function(array_sum());
    module.add_function(neighbours());

    let text = module.to_json().unwrap();
    let mut restored = IrModule::from_json(&text).unwrap();
    assert_eq!(restored.functions.len(), 2);
    for (a, b) in module.functions.iter().zip(&restored.functions) {
        assert_eq!(dump_function(a), dump_function(b));
    }

    let result = verifying_pipeline().run_module(&mut restored).unwrap();
    assert!(result.modified);
    let sum = restored.function("array_sum").unwrap();
    assert_eq!(count(sum, is_bounds_check), 0);
    assert!(matches!(restored.function("missing"), Err(IrError::UnknownFunction(_))));
}

#[test]
fn test_unknown_pass_is_rejected() {
    let config = OptimizerConfig::default();
    assert!(matches!(
        create_pass("no-such-pass", &config),
        Err(IrError::UnknownPass(name)) if name == "no-such-pass"
    ));

    let config = OptimizerConfig::from_toml_str(r#"passes = ["licm", "inline"]"#).unwrap();
    assert!(PassManager::from_config(&config).is_err());
}

#[test]
fn test_configured_pipeline_runs_in_order() {
    let config = OptimizerConfig::from_toml_str(
        r#"
        passes = ["checks-elimination", "dce"]

        [checks_elimination]
        dominance = "block"
        "#,
    )
    .unwrap();
    let manager = PassManager::from_config(&config).unwrap();
    assert_eq!(manager.pass_names(), vec!["checks-elimination", "dce"]);

    let mut func = array_sum();
    manager.run_function(&mut func).unwrap();
    assert_eq!(count(&func, is_bounds_check), 0);
}

#[test]
fn test_constant_loop_is_unrolled_after_checks_go() {
    //   for (i = 0; i < 4; i++) s += i * 2
    let mut b = IrBuilder::new("small");
    let zero = b.constant_typed(0, DataType::Int32);
    let four = b.constant_typed(4, DataType::Int32);
    let two = b.constant_typed(2, DataType::Int32);
    let lp = b.begin_counted_loop(zero, four, ConditionCode::Lt, 1);
    b.switch_to_block(lp.header);
    let s = b.phi(DataType::Int32, &[zero]);
    b.switch_to_block(lp.body);
    let doubled = b.binary(Opcode::Mul, DataType::Int32, lp.index, two);
    let next = b.binary(Opcode::Add, DataType::Int32, s, doubled);
    b.end_counted_loop(&lp);
    b.add_phi_input(s, next);
    b.ret(Some(s));
    let mut func = b.finish();

    let result = verifying_pipeline().run_function(&mut func).unwrap();
    assert_eq!(result.stats.get("loops_unrolled"), Some(&1));
    assert!(func.cfg.get_block(lp.header).is_none());
    assert_eq!(count(&func, |op| op == Opcode::Phi), 0);
}
