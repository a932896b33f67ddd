//! The collaborator boundary: well-known context names for sharing one
//! mutable root value between cooperating computations.
//!
//! Computations that want to collaborate on a shared value agree on these
//! names instead of threading the value through every signature; whichever
//! scope owns the value installs handlers for both.

use std::any::Any;

use super::program::{Program, ask, ask_with};

/// Context name requesting the current shared root value.
pub const GET_ROOT: &str = "store/get-root";

/// Context name replacing the shared root value; the request's argument is
/// the replacement.
pub const PUT_ROOT: &str = "store/put-root";

/// A program that reads the shared root value.
pub fn get_root<T>() -> Program<T>
where
    T: Any + Send,
{
    ask(GET_ROOT)
}

/// A program that replaces the shared root value.
pub fn put_root(value: impl Any + Send) -> Program<()> {
    ask_with(PUT_ROOT, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::scope::{Handlers, scoped};
    use crate::effect::value::{Answer, Outcome, Step};
    use crate::effect::Coroutine;
    use rstest::rstest;

    #[rstest]
    fn collaborators_share_the_root_through_the_owner() {
        use parking_lot::Mutex;
        use std::sync::Arc;

        let store = Arc::new(Mutex::new(10_i32));
        let reader = Arc::clone(&store);
        let writer = Arc::clone(&store);

        let program = get_root::<i32>()
            .flat_map(|current| put_root(current + 5))
            .then(get_root::<i32>());
        let mut scope = scoped(program.into_coroutine()).handle(
            Handlers::new()
                .provide(GET_ROOT, move || *reader.lock())
                .provide_with(PUT_ROOT, move |argument| {
                    let next = *argument
                        .expect("put-root carries its replacement")
                        .downcast::<i32>()
                        .unwrap();
                    *writer.lock() = next;
                }),
        );

        match scope.resume(Answer::Start) {
            Step::Done(Outcome::Return(value)) => {
                assert_eq!(*value.downcast::<i32>().unwrap(), 15);
            }
            step => panic!("expected completion, got {step:?}"),
        }
        assert_eq!(*store.lock(), 15);
    }
}
