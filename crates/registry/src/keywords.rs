//! Per-kind keyword vocabularies for rule-based source recommendation.

use models::SourceKind;

/// Keywords whose presence in a question suggests a backend kind.
pub fn keywords_for(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::Postgres => &[
            "table", "row", "sql", "query", "join", "database", "relational",
        ],
        SourceKind::MongoDb => &["document", "collection", "json", "nosql", "unstructured"],
        SourceKind::Qdrant => &[
            "similar",
            "vector",
            "embedding",
            "semantic",
            "similarity",
            "neural",
        ],
        SourceKind::Slack => &[
            "message",
            "channel",
            "chat",
            "conversation",
            "slack",
            "communication",
        ],
        SourceKind::Shopify => &[
            "order",
            "product",
            "customer",
            "inventory",
            "checkout",
            "cart",
            "purchase",
            "sale",
            "revenue",
            "ecommerce",
            "e-commerce",
            "shopify",
            "store",
            "merchant",
            "variant",
            "fulfillment",
            "shipping",
            "billing",
            "payment",
            "discount",
            "coupon",
        ],
        SourceKind::Ga4 => &[
            "analytics",
            "pageview",
            "session",
            "traffic",
            "visitor",
            "conversion",
            "campaign",
        ],
    }
}

/// Count of keyword hits for `kind` within a lower-cased question.
pub fn keyword_hits(question: &str, kind: SourceKind) -> usize {
    keywords_for(kind)
        .iter()
        .filter(|keyword| question.contains(*keyword))
        .count()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commerce_questions_hit_shopify() {
        let question = "total revenue from orders with a discount applied";
        assert!(keyword_hits(question, SourceKind::Shopify) >= 3);
        assert_eq!(keyword_hits(question, SourceKind::Qdrant), 0);
    }
}
