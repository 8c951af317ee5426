/// Renders the instruction block handed to the response generator.
use crate::model::{Candidate, Guideline};

const NONE_LINE: &str = "None.";

/// Build the system instruction from global guidelines (kept in retrieval order)
/// and the conditional guidelines that survived the relevance filter.
///
/// Conditional directives are listed most similar first; ties keep their input
/// order. Conditions are never rendered.
pub fn assemble(global: &[Guideline], conditional: &[Candidate]) -> String {
    let global_section = numbered(global.iter().map(|g| g.directive.as_str()));

    let mut ranked: Vec<&Candidate> = conditional.iter().collect();
    ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    let conditional_section = numbered(ranked.into_iter().map(Candidate::directive));

    format!(
        r#"You are a customer service assistant. Follow the guidelines below when you reply.

<global_guidelines>
These guidelines apply to every interaction.
{global_section}
</global_guidelines>

<conditional_guidelines>
These guidelines were selected for this specific interaction.
{conditional_section}
</conditional_guidelines>

<policy>
- Apply every global guideline unconditionally.
- The conditional guidelines have already been checked against this conversation; apply them.
- Set a guideline aside only if it conflicts with an earlier request from the user or is clearly inappropriate in context.
- Never make up information you do not have. If you do not know something, say so.
</policy>"#
    )
}

fn numbered<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let lines: Vec<String> = items
        .enumerate()
        .map(|(i, text)| format!("{}. {}", i + 1, text))
        .collect();
    if lines.is_empty() {
        NONE_LINE.to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::model::GuidelineId;
    use crate::testing::candidate;

    fn section<'a>(prompt: &'a str, tag: &str) -> &'a str {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = prompt.find(&open).unwrap() + open.len();
        let end = prompt.find(&close).unwrap();
        &prompt[start..end]
    }

    #[test]
    fn globals_keep_retrieval_order() {
        let prompt = assemble(
            &[Guideline::global(9, "Be polite"), Guideline::global(2, "Use the customer's name")],
            &[],
        );
        let globals = section(&prompt, "global_guidelines");
        assert!(globals.contains("1. Be polite\n2. Use the customer's name"));
    }

    #[test]
    fn conditionals_sorted_by_similarity_with_stable_ties() {
        let prompt = assemble(
            &[],
            &[
                candidate(1, "a", "Low", 0.2),
                candidate(2, "b", "Tie first", 0.8),
                candidate(3, "c", "High", 0.95),
                candidate(4, "d", "Tie second", 0.8),
            ],
        );
        let conditionals = section(&prompt, "conditional_guidelines");
        assert!(conditionals.contains("1. High\n2. Tie first\n3. Tie second\n4. Low"));
    }

    #[test]
    fn conditions_are_withheld() {
        let prompt = assemble(
            &[Guideline::global(1, "Be polite")],
            &[candidate(3, "customer requests refund", "Offer a discount instead of a refund", 0.9)],
        );
        assert!(prompt.contains("Offer a discount instead of a refund"));
        assert!(!prompt.contains("customer requests refund"));
    }

    #[test]
    fn empty_sections_render_none() {
        let prompt = assemble(&[], &[]);
        assert!(section(&prompt, "global_guidelines").contains("\nNone.\n"));
        assert!(section(&prompt, "conditional_guidelines").contains("\nNone.\n"));
        assert!(prompt.contains("Never make up information"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let globals = [Guideline::global(1, "Be polite")];
        let conditionals = [candidate(3, "refund", "Offer a discount", 0.9)];
        assert_eq!(assemble(&globals, &conditionals), assemble(&globals, &conditionals));
    }

    /// Similarity drawn from a few coarse values so ties are common.
    fn arb_similarity() -> impl Strategy<Value = f32> {
        prop_oneof![
            (0u8..5).prop_map(|n| f32::from(n) / 4.0),
            -1.0f32..1.0,
        ]
    }

    /// Input positions of the rendered conditional directives, top to bottom.
    fn rendered_positions(prompt: &str) -> Vec<usize> {
        section(prompt, "conditional_guidelines")
            .lines()
            .filter_map(|line| line.split_once(". directive-"))
            .map(|(_, position)| position.parse().unwrap())
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every conditional directive is rendered once, in non-increasing
        /// similarity, with equal similarities in input order.
        #[test]
        fn prop_conditionals_rank_by_similarity_then_input_order(
            similarities in prop::collection::vec(arb_similarity(), 0..20)
        ) {
            let candidates: Vec<Candidate> = similarities
                .iter()
                .enumerate()
                .map(|(i, &s)| candidate(i as GuidelineId, "condition", &format!("directive-{i}"), s))
                .collect();

            let positions = rendered_positions(&assemble(&[], &candidates));

            let mut seen = positions.clone();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..similarities.len()).collect::<Vec<_>>());

            for pair in positions.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                let order = similarities[a].total_cmp(&similarities[b]);
                prop_assert!(
                    order.is_gt() || (order.is_eq() && a < b),
                    "directive-{} ({}) rendered before directive-{} ({})",
                    a, similarities[a], b, similarities[b]
                );
            }
        }
    }
}
