//! Property-based tests for Effect<A> laws.
//!
//! - **Functor Laws**: identity and composition
//! - **Monad Laws**: left identity, right identity, associativity
//! - **Error Laws**: failures short-circuit, `catch_all` recovers

use lambars_effect::prelude::*;
use proptest::prelude::*;

fn run<A: Send + 'static>(effect: &Effect<A>) -> Result<A> {
    effect.run(&Env::new())
}

proptest! {
    #[test]
    fn prop_functor_identity(value in any::<i64>()) {
        prop_assert_eq!(run(&Effect::pure(value).map(|x| x)), Ok(value));
    }

    #[test]
    fn prop_functor_composition(value in -1_000_i64..1_000) {
        let f = |x: i64| x * 3;
        let g = |x: i64| x - 7;
        let chained = Effect::pure(value).map(f).map(g);
        let composed = Effect::pure(value).map(move |x| g(f(x)));
        prop_assert_eq!(run(&chained), run(&composed));
    }

    #[test]
    fn prop_monad_left_identity(value in any::<i32>()) {
        let f = |x: i32| Effect::pure(x.wrapping_mul(2));
        prop_assert_eq!(run(&Effect::pure(value).bind(f)), run(&f(value)));
    }

    #[test]
    fn prop_monad_right_identity(value in any::<i32>()) {
        prop_assert_eq!(run(&Effect::pure(value).bind(Effect::pure)), Ok(value));
    }

    #[test]
    fn prop_monad_associativity(value in -1_000_i32..1_000) {
        let f = |x: i32| Effect::pure(x + 1);
        let g = |x: i32| Effect::pure(x * 5);
        let left = Effect::pure(value).bind(f).bind(g);
        let right = Effect::pure(value).bind(move |x| f(x).bind(g));
        prop_assert_eq!(run(&left), run(&right));
    }

    #[test]
    fn prop_failure_short_circuits(message in "[a-z]{1,12}", value in any::<i32>()) {
        let effect = Effect::<i32>::fail(Error::domain(message.clone()))
            .map(move |_| value)
            .bind(Effect::pure);
        prop_assert_eq!(run(&effect), Err(Error::domain(message)));
    }

    #[test]
    fn prop_catch_all_recovers(message in "[a-z]{1,12}", fallback in any::<i32>()) {
        let effect = Effect::<i32>::fail(Error::domain(message))
            .catch_all(move |_| Effect::pure(fallback));
        prop_assert_eq!(run(&effect), Ok(fallback));
    }

    #[test]
    fn prop_zip_preserves_both_values(left in any::<u16>(), right in any::<u16>()) {
        prop_assert_eq!(run(&Effect::pure(left).zip(Effect::pure(right))), Ok((left, right)));
    }
}
