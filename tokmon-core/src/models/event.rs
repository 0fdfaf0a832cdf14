use serde::{Deserialize, Serialize};

use super::{ChatExchange, TokenUsageSummary};

/// Frame pushed to observers after an ingest, `{"type": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayEvent {
    #[serde(rename = "chatExchange")]
    ChatExchange(ChatExchange),
    #[serde(rename = "tokenUsageSummary")]
    TokenUsageSummary(TokenUsageSummary),
}

impl RelayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::ChatExchange(_) => "chatExchange",
            RelayEvent::TokenUsageSummary(_) => "tokenUsageSummary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let exchange = ChatExchange::new("conv-1", json!({}), json!({}));
        let json = serde_json::to_value(RelayEvent::ChatExchange(exchange.clone())).unwrap();

        assert_eq!(json["type"], "chatExchange");
        assert_eq!(json["data"]["conversation_id"], "conv-1");
        assert_eq!(json["data"]["id"], exchange.id.to_string());

        let summary = TokenUsageSummary::empty("conv-1");
        let event = RelayEvent::TokenUsageSummary(summary);
        assert_eq!(event.kind(), "tokenUsageSummary");
        let text = serde_json::to_string(&event).unwrap();
        let back: RelayEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
