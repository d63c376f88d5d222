/// A state machine driven one input at a time.
///
/// Anything a transition needs to remember, or to tell the caller, goes into
/// the context.
pub trait FiniteStateMachine {
    type Input;
    type Context;

    #[must_use]
    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self;
}
