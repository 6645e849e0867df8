//! End-to-end engine scenarios.
//!
//! Each test drives the public constructor surface the way an embedding
//! application would: build a graph, write sources, observe propagation,
//! close cells, drop handles. Tests run on their own threads, so each one
//! gets a fresh engine; `reset_engine` is still called first in case the
//! runner shares threads.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cellflow::{
    action_with, calc, calc_with, calc_with_opts, const_var, expr_cell, field, is_open,
    reset_engine, var, var_struct, AlwaysTrigger, BindError, ChangeTrigger, CloseStrategy, Field,
    FieldOwner, FieldStruct, KeepStrategy, LastValueStrategy, ThresholdTrigger,
};

fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
    let c = Rc::new(Cell::new(0));
    (c.clone(), c)
}

// =============================================================================
// Linear chains
// =============================================================================

#[test]
fn linear_chain_recomputes_downstream() {
    reset_engine();
    let a = var(1);
    let b = var(3.14);

    let s = calc_with(|x: i32, y: f64| format!("{x}{y:.6}"), (&a, &b));
    let t = calc_with(|x: i32, sv: String| format!("{x}{sv}"), (&a, &s));

    assert_eq!(s.get(), "13.140000");
    assert_eq!(t.get(), "113.140000");

    a.set(2);
    assert_eq!(s.get(), "23.140000");
    assert_eq!(t.get(), "223.140000");
}

#[test]
fn five_layer_chain_with_shared_inputs() {
    reset_engine();
    let a = var(1);

    let ds_a = calc_with(|x: i32| x, (&a,));
    let ds_b = calc_with(|x: i32, av: i32| x + av, (&a, &ds_a));
    let ds_c = calc_with(|x: i32, av: i32, bv: i32| x + av + bv, (&a, &ds_a, &ds_b));
    let ds_d = calc_with(|av: i32, bv: i32, cv: i32| av + bv + cv, (&ds_a, &ds_b, &ds_c));
    let ds_e = calc_with(|bv: i32, cv: i32, dv: i32| bv * cv + dv, (&ds_b, &ds_c, &ds_d));

    assert_eq!(ds_a.get(), 1);
    assert_eq!(ds_b.get(), 2);
    assert_eq!(ds_c.get(), 4);
    assert_eq!(ds_d.get(), 7);
    assert_eq!(ds_e.get(), 15);

    a.set(10);
    assert_eq!(ds_a.get(), 10);
    assert_eq!(ds_b.get(), 20);
    assert_eq!(ds_c.get(), 40);
    assert_eq!(ds_d.get(), 70);
    assert_eq!(ds_e.get(), 870);
}

// =============================================================================
// Diamonds and repeat dependencies
// =============================================================================

#[test]
fn diamond_evaluates_each_cell_once_per_write() {
    reset_engine();
    let a = var(1);
    let (na, ca) = counter();
    let (nb, cb) = counter();
    let (nd, cd) = counter();

    let ar = a.reader();
    let left = calc(move || {
        na.set(na.get() + 1);
        ar.get() + 1
    });
    let ar = a.reader();
    let right = calc(move || {
        nb.set(nb.get() + 1);
        ar.get() + 2
    });
    let (lr, rr) = (left.reader(), right.reader());
    let ds = calc(move || {
        nd.set(nd.get() + 1);
        lr.get() + rr.get() + 5
    });

    assert_eq!(ds.get(), 10);
    ca.set(0);
    cb.set(0);
    cd.set(0);

    a.set(2);

    assert_eq!(ca.get(), 1);
    assert_eq!(cb.get(), 1);
    assert_eq!(cd.get(), 1);
    assert_eq!(ds.get(), 12);
}

#[test]
fn repeat_dependency_is_detected_and_glitch_free() {
    reset_engine();
    let src = var(10);
    let step = calc_with(|x: i32| x * 2, (&src,));

    // `sink` reads src both directly and through `step`: two paths.
    let seen = Rc::new(Cell::new((0, 0)));
    let s = seen.clone();
    let sink = calc_with(
        move |x: i32, sv: i32| {
            s.set((x, sv));
            x + sv
        },
        (&src, &step),
    );

    assert!(cellflow::is_repeat_dependent(sink.id(), src.id()));

    src.set(11);
    // The closure saw pulse-final values of both inputs.
    assert_eq!(seen.get(), (11, 22));
    assert_eq!(sink.get(), 33);
}

#[test]
fn repeat_dependency_still_evaluates_inputs_once() {
    reset_engine();
    let a = var(1);
    let b = var(2);
    let (n, evals) = counter();

    let ds_a = calc_with(
        move |x: i32, y: i32| {
            n.set(n.get() + 1);
            x + y
        },
        (&a, &b),
    );
    let ds_b = calc_with(|x: i32, av: i32| x + av, (&a, &ds_a));

    evals.set(0);
    a.set(3);
    assert_eq!(evals.get(), 1);
    assert_eq!(ds_b.get(), 8);

    assert!(cellflow::is_repeat_dependent(ds_b.id(), a.id()));
}

// =============================================================================
// Cycle rejection
// =============================================================================

#[test]
fn rebind_closing_a_loop_is_rejected_and_state_preserved() {
    reset_engine();
    let a = var(1);
    let b = var(2);
    let c = var(3);

    let ds_a = calc_with(|bv: i32| bv, (&b,));
    let ds_b = calc_with(|cv: i32| cv, (&c,));
    let ds_c = calc_with(|av: i32| av, (&a,));
    ds_a.set_name("dsA");
    ds_b.set_name("dsB");
    ds_c.set_name("dsC");

    ds_a.rebind_with(|bv: i32, dbv: i32| bv + dbv, (&b, &ds_b)).unwrap();
    ds_b.rebind_with(|cv: i32, dcv: i32| cv * dcv, (&c, &ds_c)).unwrap();

    let err = ds_c
        .rebind_with(|av: i32, dav: i32| av - dav, (&a, &ds_a))
        .unwrap_err();
    assert!(matches!(err, BindError::CycleDependency { .. }));

    // Prior bindings survive the rejection.
    a.set(7);
    assert_eq!(ds_c.get(), 7);
    assert_eq!(ds_b.get(), 3 * 7);
    assert_eq!(ds_a.get(), 2 + 21);
}

#[test]
fn self_dependency_is_rejected() {
    reset_engine();
    let a = var(1);
    let ds = calc_with(|x: i32| x, (&a,));

    let err = ds
        .rebind_with(|x: i32, me: i32| x + me, (&a, &ds))
        .unwrap_err();
    assert!(matches!(err, BindError::CycleDependency { .. }));
    assert_eq!(ds.get(), 1);
}

// =============================================================================
// Trigger policies
// =============================================================================

#[test]
fn change_trigger_skips_unchanged_values() {
    reset_engine();
    let a = var(1);
    let c = var("cc".to_string());
    let (na, ca) = counter();
    let (nb, cb) = counter();

    let ds = calc_with(
        move |x: i32| {
            na.set(na.get() + 1);
            format!("{x}")
        },
        (&a,),
    );
    let dds = calc_with_opts(
        move |cv: String, sv: String| {
            nb.set(nb.get() + 1);
            format!("{cv}{sv}")
        },
        (&c, &ds),
        ChangeTrigger,
        CloseStrategy,
    );

    assert_eq!(ca.get(), 1);
    assert_eq!(cb.get(), 1);

    // Same value: upstream recomputes, downstream change-gate holds it back.
    a.set(1);
    assert_eq!(ca.get(), 2);
    assert_eq!(cb.get(), 1);

    a.set(2);
    assert_eq!(ca.get(), 3);
    assert_eq!(cb.get(), 2);
    assert_eq!(dds.get(), "cc2");
}

#[test]
fn threshold_trigger_gates_reevaluation() {
    reset_engine();
    let price = var(100.0);
    let (n, evals) = counter();

    let advice = calc_with_opts(
        move |p: f64| {
            n.set(n.get() + 1);
            if p > 105.0 { "sell" } else { "hold" }.to_string()
        },
        (&price,),
        ThresholdTrigger::new(),
        CloseStrategy,
    );
    let pr = price.reader();
    advice.set_threshold(move || pr.get() > 105.0 || pr.get() < 95.0);

    assert_eq!(advice.get(), "hold");
    evals.set(0);

    // Inside the [95, 105] band nothing happens.
    price.set(101.0);
    assert_eq!(evals.get(), 0);
    assert_eq!(advice.get(), "hold");

    price.set(106.0);
    assert_eq!(evals.get(), 1);
    assert_eq!(advice.get(), "sell");

    price.set(90.0);
    assert_eq!(advice.get(), "hold");
}

// =============================================================================
// Cascade close
// =============================================================================

#[test]
fn closing_a_cell_closes_exactly_its_transitive_observers() {
    reset_engine();
    let a = var(1);
    let b = var(2);

    let ds_a = calc_with(|x: i32| x, (&a,));
    let ds_b = calc_with(|x: i32, av: i32| x + av, (&a, &ds_a));
    let ds_c = calc_with(|x: i32, av: i32, bv: i32| x + av + bv, (&a, &ds_a, &ds_b));
    let ds_d = calc_with(|av: i32, bv: i32, cv: i32| av + bv + cv, (&ds_a, &ds_b, &ds_c));
    let ds_e = calc_with(|bv: i32, cv: i32, dv: i32| bv * cv + dv, (&ds_b, &ds_c, &ds_d));
    let ds_f = calc_with(|x: i32, y: i32| x + y, (&a, &b));
    let ds_g = calc_with(|av: i32, fv: i32| av + fv, (&ds_a, &ds_f));

    ds_a.close();

    assert!(!ds_a.is_open());
    assert!(!ds_b.is_open());
    assert!(!ds_c.is_open());
    assert!(!ds_d.is_open());
    assert!(!ds_e.is_open());
    assert!(ds_f.is_open());
    assert!(!ds_g.is_open());
    assert!(a.is_open());
    assert!(b.is_open());

    // Survivors keep reacting.
    a.set(5);
    assert_eq!(ds_f.get(), 7);
}

#[test]
fn closed_handles_fault_on_read_and_report_closed() {
    reset_engine();
    let a = var(1);
    let ds = calc_with(|x: i32| x, (&a,));

    ds.close();

    assert!(!ds.is_open());
    assert!(!bool::from(&ds));
    assert!(ds.try_get().is_err());

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ds.get()));
    assert!(caught.is_err());
}

// =============================================================================
// Invalidation strategies
// =============================================================================

#[test]
fn default_strategy_closes_dependents_when_last_handle_drops() {
    reset_engine();
    let a = var(1);
    let survivor = calc_with(|x: i32| x + 100, (&a,));
    let doomed = calc_with(|x: i32| x, (&a,));

    {
        let temp = calc_with(|x: i32| x + 1, (&a,));
        doomed.rebind_with(|t: i32| t * 10, (&temp,)).unwrap();
        assert_eq!(doomed.get(), 20);
    } // temp's last handle drops here

    assert!(!doomed.is_open());
    assert!(survivor.is_open());
    assert_eq!(survivor.get(), 101);
}

#[test]
fn keep_strategy_cell_outlives_its_handles() {
    reset_engine();
    let a = var(1);
    let ds_b = calc_with(|x: i32| x, (&a,));

    {
        let temp = calc_with_opts(
            |x: i32| x + 1,
            (&a,),
            AlwaysTrigger,
            KeepStrategy,
        );
        ds_b.rebind_with(|x: i32, t: i32| x + t, (&a, &temp)).unwrap();
        assert_eq!(ds_b.get(), 3);
    }

    // The anonymous cell keeps computing for its observer.
    assert!(ds_b.is_open());
    a.set(10);
    assert_eq!(ds_b.get(), 21);
}

#[test]
fn last_value_strategy_freezes_on_death() {
    reset_engine();
    let a = var(1);
    let ds_b = calc_with(|x: i32| x, (&a,));

    {
        let temp = calc_with_opts(
            |x: i32| x,
            (&a,),
            AlwaysTrigger,
            LastValueStrategy,
        );
        ds_b.rebind_with(|t: i32| t, (&temp,)).unwrap();
        assert_eq!(ds_b.get(), 1);
    } // temp freezes at 1

    assert!(ds_b.is_open());
    a.set(2);
    assert_eq!(ds_b.get(), 1);
    a.set(99);
    assert_eq!(ds_b.get(), 1);
}

#[test]
fn weak_count_tracks_clones() {
    reset_engine();
    let a = var(1);
    let id = a.id();
    let extra = a.clone();

    drop(a);
    assert!(is_open(id));

    drop(extra);
    assert!(!is_open(id));
}

// =============================================================================
// Rebinding
// =============================================================================

#[test]
fn rebind_replaces_the_dependency_set() {
    reset_engine();
    let b = var("2".to_string());
    let c = var("3".to_string());
    let d = var("4".to_string());
    let dds = calc_with(|s: String| s, (&b,));
    let ddds = calc_with(|s: String| s, (&c,));

    assert_eq!(ddds.get(), "3");

    ddds.rebind_with(
        |dv: String, dsv: String| format!("{dv}{dsv}set"),
        (&d, &dds),
    )
    .unwrap();
    assert_eq!(ddds.get(), "42set");

    // The old input no longer reaches the rebound cell.
    c.set("33".to_string());
    assert_eq!(ddds.get(), "42set");

    d.set("44".to_string());
    assert_eq!(ddds.get(), "442set");
}

#[test]
fn rebind_to_capture_style_closure() {
    reset_engine();
    let a = var(2);
    let b = var(3);
    let ds = calc_with(|x: i32| x, (&a,));
    assert_eq!(ds.get(), 2);

    let (ar, br) = (a.reader(), b.reader());
    ds.rebind(move || ar.get() * br.get()).unwrap();
    assert_eq!(ds.get(), 6);
    assert_eq!(cellflow::dependents_of(ds.id()), vec![a.id(), b.id()]);

    b.set(5);
    assert_eq!(ds.get(), 10);
}

#[test]
fn rebind_type_change_is_rejected() {
    reset_engine();
    let a = var(1.0_f64);
    let ds = calc_with(|x: f64| x * 2.0, (&a,));

    let err = ds.rebind(|| 42_i64).unwrap_err();
    assert!(matches!(err, BindError::ReturnTypeMismatch { .. }));

    // Still the original closure.
    a.set(3.0);
    assert_eq!(ds.get(), 6.0);
}

// =============================================================================
// Actions and const cells
// =============================================================================

#[test]
fn actions_fire_on_construction_and_on_writes() {
    reset_engine();
    let temperature = var(25.0);
    let humidity = var(60.0);
    let index = calc_with(|t: f64, h: f64| t + h * 0.1, (&temperature, &humidity));

    let seen = Rc::new(Cell::new(0.0));
    let s = seen.clone();
    let act = action_with(move |thi: f64| s.set(thi), (&index,));

    assert_eq!(seen.get(), 31.0);

    temperature.set(30.0);
    assert_eq!(seen.get(), 36.0);

    humidity.set(70.0);
    assert_eq!(seen.get(), 37.0);
    assert!(act.is_open());
}

#[test]
fn const_cells_feed_computations() {
    reset_engine();
    let a = const_var(1);
    let b = const_var(3.14);
    let ds = calc_with(|x: i32, y: f64| format!("{x}{y:.6}"), (&a, &b));
    assert_eq!(ds.get(), "13.140000");
}

// =============================================================================
// Expression cells and write operators
// =============================================================================

#[test]
fn expression_cell_tracks_all_leaves() {
    reset_engine();
    let a = var(1.0);
    let b = var(2.0);
    let c = var(4.0);

    let ds = expr_cell(&a + &b * 2.0 - &c);
    assert_eq!(ds.get(), 1.0);

    b.set(3.0);
    assert_eq!(ds.get(), 3.0);
    c.set(0.0);
    assert_eq!(ds.get(), 7.0);
}

#[test]
fn compound_assignment_operators_pulse() {
    reset_engine();
    let mut a = var(10);
    let doubled = calc_with(|x: i32| x * 2, (&a,));

    a += 5;
    assert_eq!(doubled.get(), 30);
    a -= 3;
    assert_eq!(doubled.get(), 24);
    a *= 2;
    assert_eq!(doubled.get(), 48);
    a /= 4;
    assert_eq!(doubled.get(), 12);

    a.inc();
    assert_eq!(doubled.get(), 14);
    a.dec();
    assert_eq!(doubled.get(), 12);
}

#[test]
fn update_reevaluates_without_notifying() {
    reset_engine();
    let a = var(1);
    let b = calc_with(|x: i32| x + 1, (&a,));
    let (n, evals) = counter();
    let _c = calc_with(
        move |x: i32| {
            n.set(n.get() + 1);
            x
        },
        (&b,),
    );

    evals.set(0);
    assert_eq!(b.update(), 2);
    assert_eq!(evals.get(), 0);
}

// =============================================================================
// Fields
// =============================================================================

#[derive(Debug)]
struct Person {
    owner: FieldOwner,
    name: Field<String>,
    age: Field<i32>,
}

impl Person {
    fn new(name: &str, age: i32) -> Self {
        let owner = FieldOwner::new();
        let name = field(&owner, name.to_string());
        let age = field(&owner, age);
        Self { owner, name, age }
    }

    fn name(&self) -> String {
        self.name.get()
    }

    fn set_name(&self, name: &str) {
        self.name.set(name.to_string());
    }

    fn age(&self) -> i32 {
        self.age.get()
    }

    fn set_age(&self, age: i32) {
        self.age.set(age);
    }
}

impl FieldStruct for Person {
    fn field_owner(&self) -> &FieldOwner {
        &self.owner
    }
}

impl Clone for Person {
    fn clone(&self) -> Self {
        let owner = FieldOwner::new();
        let name = field(&owner, self.name.get());
        let age = field(&owner, self.age.get());
        Self { owner, name, age }
    }
}

impl PartialEq for Person {
    fn eq(&self, other: &Self) -> bool {
        self.name.get() == other.name.get() && self.age.get() == other.age.get()
    }
}

#[test]
fn field_writes_wake_container_observers() {
    reset_engine();
    let p = var_struct(Person::new("lummy", 18));
    let a = var(1);

    let ds = calc_with(
        |x: i32, person: Person| format!("{x}{}", person.name()),
        (&a, &p),
    );
    assert_eq!(ds.get(), "1lummy");

    p.with_ref(|person| person.set_name("lummy-new"));
    assert_eq!(ds.get(), "1lummy-new");

    p.with_ref(|person| person.set_age(19));
    assert_eq!(p.with_ref(|person| person.age()), 19);
}

#[test]
fn container_reassignment_repoints_fields() {
    reset_engine();
    let p = var_struct(Person::new("alice", 30));
    let greetings = calc_with(
        |person: Person| format!("hello {}", person.name()),
        (&p,),
    );
    assert_eq!(greetings.get(), "hello alice");

    p.set(Person::new("bob", 40));
    assert_eq!(greetings.get(), "hello bob");

    // The new aggregate's fields drive the container now.
    p.with_ref(|person| person.set_name("bob-jones"));
    assert_eq!(greetings.get(), "hello bob-jones");
}

#[test]
fn field_write_fires_sub_observers_before_container_observers() {
    reset_engine();
    let p = var_struct(Person::new("ann", 5));
    let name_handle = p.with_ref(|person| person.name.clone());
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    let _direct = calc_with(
        move |n: String| {
            o.borrow_mut().push("sub");
            n
        },
        (&name_handle,),
    );
    let o = order.clone();
    let _via_container = calc_with(
        move |person: Person| {
            o.borrow_mut().push("container");
            person.name()
        },
        (&p,),
    );

    order.borrow_mut().clear();
    p.with_ref(|person| person.set_name("bea"));

    assert_eq!(*order.borrow(), vec!["sub", "container"]);
}

#[test]
fn two_reactive_aggregates_compose() {
    reset_engine();
    let p1 = var_struct(Person::new("Alice", 30));
    let p2 = var_struct(Person::new("Jack", 20));

    let (n, evals) = counter();
    let combined = calc_with(
        move |a: Person, b: Person| {
            n.set(n.get() + 1);
            format!("{} {} / {} {}", a.name(), a.age(), b.name(), b.age())
        },
        (&p1, &p2),
    );

    assert_eq!(combined.get(), "Alice 30 / Jack 20");

    evals.set(0);
    p1.with_ref(|p| p.set_name("Alice Johnson"));
    p1.with_ref(|p| p.set_age(37));
    p2.with_ref(|p| p.set_name("Jack Jones"));
    assert_eq!(evals.get(), 3);
    assert_eq!(combined.get(), "Alice Johnson 37 / Jack Jones 20");
}

// =============================================================================
// Deep mixed-type chain
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Processed {
    info: String,
    checksum: i64,
}

#[test]
fn deep_mixed_type_chain_stays_consistent() {
    reset_engine();
    let base1 = var(1_i64);
    let base2 = var(2.0_f64);
    let base3 = var(true);
    let base4 = var("3".to_string());
    let base5 = var(4_i64);

    let layer1 = calc_with(|a: i64, b: f64| a as f64 + b, (&base1, &base2));
    let layer2 = calc_with(
        |v: f64, flag: bool| if flag { v * 2.0 } else { v / 2.0 },
        (&layer1, &base3),
    );
    let layer3 = calc_with(|v: f64| format!("Value:{v:.2}"), (&layer2,));
    let layer4 = calc_with(|s: String, s4: String| format!("{s}_{s4}"), (&layer3, &base4));
    let layer5 = calc_with(|s: String| s.len() as i64, (&layer4,));
    let layer6 = calc_with(
        |len: i64, b5: i64| vec![b5; len as usize],
        (&layer5, &base5),
    );
    let layer7 = calc_with(|v: Vec<i64>| v.iter().sum::<i64>(), (&layer6,));
    let layer8 = calc_with(
        |sum: i64| Processed {
            info: "Processed".to_string(),
            checksum: sum,
        },
        (&layer7,),
    );
    let final_layer = calc_with(
        |p: Processed| format!("Final:{}|{}", p.info, p.checksum),
        (&layer8,),
    );

    for i in 0..50_i64 {
        base1.set(i % 10);
        base2.set((i % 10) as f64 * 0.1);
        base3.set(i % 2 == 0);

        let l1 = (i % 10) as f64 + (i % 10) as f64 * 0.1;
        let l2 = if i % 2 == 0 { l1 * 2.0 } else { l1 / 2.0 };
        let l3 = format!("Value:{l2:.2}");
        let l4 = format!("{l3}_3");
        let l5 = l4.len() as i64;
        let l7 = 4 * l5;
        let expected = format!("Final:Processed|{l7}");

        assert_eq!(final_layer.get(), expected);
    }
}
