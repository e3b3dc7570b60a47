//! Command-buffer and encoder lifecycle as a pure state machine.
//!
//! [`plan`] turns a high-level [`Request`] into the exact [`Command`]
//! sequence a [`crate::Device`] must receive from the current
//! [`EncoderState`]; [`step`] is the single-command transition relation the
//! plans are checked against. Neither touches a device.

/// Where the context is in the lifecycle of its (single) command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncoderState {
    /// No command buffer.
    #[default]
    Idle,
    /// An uncommitted command buffer with no encoder open.
    BufferOpen,
    /// A compute encoder is open.
    EncodingCompute,
    /// A transfer (blit) encoder is open.
    EncodingTransfer,
}

impl EncoderState {
    #[must_use]
    pub const fn has_command_buffer(self) -> bool {
        !matches!(self, EncoderState::Idle)
    }

    #[must_use]
    pub const fn has_open_encoder(self) -> bool {
        matches!(
            self,
            EncoderState::EncodingCompute | EncoderState::EncodingTransfer
        )
    }
}

/// What the caller-facing API needs from the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    /// A kernel is about to be bound; a compute encoder must be open.
    ActivateKernel,
    /// A buffer's GPU contents must reach its staging copy before returning.
    Synchronize,
    /// All recorded work must be committed and complete.
    Finish,
}

/// One native call issued to a [`crate::Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    BeginCommandBuffer,
    BeginComputeEncoder,
    BeginTransferEncoder,
    EndEncoder,
    SynchronizeResource,
    Commit,
    WaitUntilCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{command:?} is not valid in state {state:?}")]
pub struct InvalidTransition {
    pub state: EncoderState,
    pub command: Command,
}

/// Applies a single command.
///
/// # Errors
///
/// Returns [`InvalidTransition`] for any command that would open a second
/// encoder, encode outside a command buffer, or commit with an encoder open.
pub fn step(state: EncoderState, command: Command) -> Result<EncoderState, InvalidTransition> {
    use Command as C;
    use EncoderState as S;

    match (state, command) {
        (S::Idle, C::BeginCommandBuffer) => Ok(S::BufferOpen),
        (S::BufferOpen, C::BeginComputeEncoder) => Ok(S::EncodingCompute),
        (S::BufferOpen, C::BeginTransferEncoder)
        | (S::EncodingTransfer, C::SynchronizeResource) => Ok(S::EncodingTransfer),
        (S::EncodingCompute | S::EncodingTransfer, C::EndEncoder) => Ok(S::BufferOpen),
        (S::BufferOpen, C::Commit) | (S::Idle, C::WaitUntilCompleted) => Ok(S::Idle),
        _ => Err(InvalidTransition { state, command }),
    }
}

/// Command sequence that satisfies `request` from `state`.
#[must_use]
pub fn plan(state: EncoderState, request: Request) -> Vec<Command> {
    use Command as C;
    use EncoderState as S;

    let mut commands = Vec::with_capacity(7);
    match request {
        Request::ActivateKernel => match state {
            S::Idle => commands.extend([C::BeginCommandBuffer, C::BeginComputeEncoder]),
            S::BufferOpen => commands.push(C::BeginComputeEncoder),
            S::EncodingCompute => {}
            S::EncodingTransfer => commands.extend([C::EndEncoder, C::BeginComputeEncoder]),
        },
        Request::Synchronize => {
            match state {
                S::Idle => commands.push(C::BeginCommandBuffer),
                S::BufferOpen => {}
                S::EncodingCompute | S::EncodingTransfer => commands.push(C::EndEncoder),
            }
            commands.extend([
                C::BeginTransferEncoder,
                C::SynchronizeResource,
                C::EndEncoder,
                C::Commit,
                C::WaitUntilCompleted,
            ]);
        }
        Request::Finish => match state {
            S::Idle => {}
            S::BufferOpen => commands.extend([C::Commit, C::WaitUntilCompleted]),
            S::EncodingCompute | S::EncodingTransfer => {
                commands.extend([C::EndEncoder, C::Commit, C::WaitUntilCompleted]);
            }
        },
    }
    commands
}

/// State reached by running `commands` from `state`.
///
/// # Errors
///
/// Returns the first [`InvalidTransition`] encountered.
pub fn run(state: EncoderState, commands: &[Command]) -> Result<EncoderState, InvalidTransition> {
    commands.iter().try_fold(state, |state, &command| step(state, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [EncoderState; 4] = [
        EncoderState::Idle,
        EncoderState::BufferOpen,
        EncoderState::EncodingCompute,
        EncoderState::EncodingTransfer,
    ];
    const REQUESTS: [Request; 3] = [Request::ActivateKernel, Request::Synchronize, Request::Finish];

    #[test]
    fn every_plan_is_a_valid_command_sequence() {
        for state in STATES {
            for request in REQUESTS {
                let commands = plan(state, request);
                assert!(
                    run(state, &commands).is_ok(),
                    "plan({state:?}, {request:?}) = {commands:?} is not accepted by step"
                );
            }
        }
    }

    #[test]
    fn plans_end_in_the_expected_state() {
        for state in STATES {
            assert_eq!(
                run(state, &plan(state, Request::ActivateKernel)),
                Ok(EncoderState::EncodingCompute)
            );
            assert_eq!(run(state, &plan(state, Request::Synchronize)), Ok(EncoderState::Idle));
            assert_eq!(run(state, &plan(state, Request::Finish)), Ok(EncoderState::Idle));
        }
    }

    #[test]
    fn activate_from_idle_opens_buffer_then_compute() {
        assert_eq!(
            plan(EncoderState::Idle, Request::ActivateKernel),
            vec![Command::BeginCommandBuffer, Command::BeginComputeEncoder]
        );
    }

    #[test]
    fn activate_while_computing_reuses_encoder() {
        assert!(plan(EncoderState::EncodingCompute, Request::ActivateKernel).is_empty());
    }

    #[test]
    fn activate_closes_open_transfer_encoder_first() {
        assert_eq!(
            plan(EncoderState::EncodingTransfer, Request::ActivateKernel),
            vec![Command::EndEncoder, Command::BeginComputeEncoder]
        );
    }

    #[test]
    fn synchronize_while_computing_swaps_encoders_then_waits() {
        assert_eq!(
            plan(EncoderState::EncodingCompute, Request::Synchronize),
            vec![
                Command::EndEncoder,
                Command::BeginTransferEncoder,
                Command::SynchronizeResource,
                Command::EndEncoder,
                Command::Commit,
                Command::WaitUntilCompleted,
            ]
        );
    }

    #[test]
    fn synchronize_from_idle_opens_a_fresh_command_buffer() {
        let commands = plan(EncoderState::Idle, Request::Synchronize);
        assert_eq!(commands.first(), Some(&Command::BeginCommandBuffer));
        assert_eq!(commands.last(), Some(&Command::WaitUntilCompleted));
    }

    #[test]
    fn finish_is_idempotent_when_idle() {
        assert!(plan(EncoderState::Idle, Request::Finish).is_empty());
    }

    #[test]
    fn finish_closes_encoder_before_commit() {
        assert_eq!(
            plan(EncoderState::EncodingCompute, Request::Finish),
            vec![Command::EndEncoder, Command::Commit, Command::WaitUntilCompleted]
        );
        assert_eq!(
            plan(EncoderState::BufferOpen, Request::Finish),
            vec![Command::Commit, Command::WaitUntilCompleted]
        );
    }

    #[test]
    fn second_encoder_cannot_open_while_one_is_open() {
        for state in [EncoderState::EncodingCompute, EncoderState::EncodingTransfer] {
            assert!(step(state, Command::BeginComputeEncoder).is_err());
            assert!(step(state, Command::BeginTransferEncoder).is_err());
            assert!(step(state, Command::Commit).is_err());
        }
    }

    #[test]
    fn encoding_requires_a_command_buffer() {
        let err = step(EncoderState::Idle, Command::BeginComputeEncoder).unwrap_err();
        assert_eq!(err.state, EncoderState::Idle);
        assert_eq!(err.command, Command::BeginComputeEncoder);
        assert_eq!(err.to_string(), "BeginComputeEncoder is not valid in state Idle");
        assert!(step(EncoderState::Idle, Command::Commit).is_err());
        assert!(step(EncoderState::EncodingCompute, Command::SynchronizeResource).is_err());
    }
}
