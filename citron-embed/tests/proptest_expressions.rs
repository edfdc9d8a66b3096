// citron-embed - Property tests for expression compilation
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Compiled integer expressions must match 64-bit two's-complement
//! arithmetic with safe division, whether they fold at compile time or run
//! through the VM.

use citron_embed::Engine;
use citron_vm::MemoryFileSystem;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Expr {
    Const(i32),
    Param,
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Modulo(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Xor(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Bitnot(Box<Expr>),
}

fn render(expr: &Expr) -> String {
    match expr {
        Expr::Const(value) => format!("({})", value),
        Expr::Param => "a".to_string(),
        Expr::Add(l, r) => format!("({} + {})", render(l), render(r)),
        Expr::Sub(l, r) => format!("({} - {})", render(l), render(r)),
        Expr::Mul(l, r) => format!("({} * {})", render(l), render(r)),
        Expr::Div(l, r) => format!("({} / {})", render(l), render(r)),
        Expr::Modulo(l, r) => format!("({} % {})", render(l), render(r)),
        Expr::And(l, r) => format!("({} & {})", render(l), render(r)),
        Expr::Or(l, r) => format!("({} | {})", render(l), render(r)),
        Expr::Xor(l, r) => format!("({} ^ {})", render(l), render(r)),
        Expr::Neg(inner) => format!("(-{})", render(inner)),
        Expr::Bitnot(inner) => format!("(~{})", render(inner)),
    }
}

fn evaluate(expr: &Expr, a: i64) -> i64 {
    match expr {
        Expr::Const(value) => *value as i64,
        Expr::Param => a,
        Expr::Add(l, r) => evaluate(l, a).wrapping_add(evaluate(r, a)),
        Expr::Sub(l, r) => evaluate(l, a).wrapping_sub(evaluate(r, a)),
        Expr::Mul(l, r) => evaluate(l, a).wrapping_mul(evaluate(r, a)),
        Expr::Div(l, r) => {
            let divisor = evaluate(r, a);
            if divisor == 0 {
                0
            } else {
                evaluate(l, a).wrapping_div(divisor)
            }
        }
        Expr::Modulo(l, r) => {
            let divisor = evaluate(r, a);
            if divisor == 0 {
                0
            } else {
                evaluate(l, a).wrapping_rem(divisor)
            }
        }
        Expr::And(l, r) => evaluate(l, a) & evaluate(r, a),
        Expr::Or(l, r) => evaluate(l, a) | evaluate(r, a),
        Expr::Xor(l, r) => evaluate(l, a) ^ evaluate(r, a),
        Expr::Neg(inner) => evaluate(inner, a).wrapping_neg(),
        Expr::Bitnot(inner) => !evaluate(inner, a),
    }
}

fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (-1000i32..1000).prop_map(Expr::Const),
        Just(Expr::Param),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Add(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Sub(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Mul(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Div(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Modulo(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::And(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Or(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Xor(Box::new(l), Box::new(r))),
            inner.clone().prop_map(|e| Expr::Neg(Box::new(e))),
            inner.prop_map(|e| Expr::Bitnot(Box::new(e))),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn compiled_expression_matches_reference(expr in arb_expr(), a in any::<i32>()) {
        let a = a as i64;
        let source = format!(
            "function s64 f(s64 a)\n{{\n\treturn {}\n}}\n",
            render(&expr)
        );
        let fs = MemoryFileSystem::with(&[("main.lemon", source.as_str())]);
        let mut engine = Engine::new();
        engine
            .compile_script_with_file_system("main.lemon", &fs)
            .unwrap_or_else(|e| panic!("compile failed for {}: {}", source, e));

        let result = engine
            .call_function("f", &[a as u64])
            .expect("call failed")
            .expect("missing return value");
        prop_assert_eq!(result as i64, evaluate(&expr, a));
    }
}
