use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Publish,
    Subscribe,
}

impl Action {
    /// Word used in permission violation errors. Clients match on it.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Publish => "Publish",
            Action::Subscribe => "Subscription",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
