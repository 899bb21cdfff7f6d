use std::fmt;

/// One directed stream inside the multiplexed connection.
///
/// Identified by the instruction (bundle) it belongs to and the transform
/// that produces or consumes it. Timer streams additionally carry the timer
/// family id. Equality and hashing are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalEndpoint {
    instruction_id: String,
    transform_id: String,
    timer_family_id: Option<String>,
}

impl LogicalEndpoint {
    /// Endpoint of an element data stream.
    pub fn data(instruction_id: impl Into<String>, transform_id: impl Into<String>) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            transform_id: transform_id.into(),
            timer_family_id: None,
        }
    }

    /// Endpoint of a timer stream for one timer family of a transform.
    pub fn timer(
        instruction_id: impl Into<String>,
        transform_id: impl Into<String>,
        timer_family_id: impl Into<String>,
    ) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            transform_id: transform_id.into(),
            timer_family_id: Some(timer_family_id.into()),
        }
    }

    pub fn instruction_id(&self) -> &str {
        &self.instruction_id
    }

    pub fn transform_id(&self) -> &str {
        &self.transform_id
    }

    pub fn timer_family_id(&self) -> Option<&str> {
        self.timer_family_id.as_deref()
    }

    pub fn is_timer(&self) -> bool {
        self.timer_family_id.is_some()
    }
}

impl fmt::Display for LogicalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instruction_id, self.transform_id)?;
        if let Some(family) = &self.timer_family_id {
            write!(f, "#{family}")?;
        }
        Ok(())
    }
}
