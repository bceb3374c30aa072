use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    NotStarted,
    Running,
    Completed,
    Terminated,
}

/// Events that move a job between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The process was spawned.
    Launched,
    /// The process exited, on its own or after SIGTERM.
    Exited,
    /// The stop grace period ran out and the process group is being killed.
    Killed,
}

impl JobState {
    /// The state reached by applying `transition`, or `None` if it isn't allowed from here.
    pub fn apply(self, transition: Transition) -> Option<JobState> {
        use JobState::*;
        use Transition::*;
        match (self, transition) {
            (NotStarted, Launched) => Some(Running),
            (Running, Exited) => Some(Completed),
            (Running, Killed) => Some(Terminated),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Terminated)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::NotStarted => "not started",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A point-in-time view of a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    /// `-1` until the process exits, and when it was ended by a signal.
    pub exit_code: i32,
    /// Every fault recorded for the job, joined with `"; "`. Empty if nothing went wrong.
    pub exit_reason: String,
}
