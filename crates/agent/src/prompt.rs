use std::fmt::Write as _;

use chrono::NaiveDate;

use finops_core::domain::context::ContextDocument;

use crate::llm::ToolSpec;
use crate::tools::ToolKind;

const PERSONA: &str = "You are an expert FinOps analyst with deep knowledge of cloud cost \
optimization, AWS billing and commitment-based discounts. Answer with specific numbers and \
actionable recommendations.";

const CUR_GUIDANCE: &str = r#"# Cost and Usage Report queries
- Write `{table}` where the report table belongs. Never write the database or table name yourself.
- Column names contain forward slashes and MUST be double-quoted: "lineitem/unblendedcost", not lineitem_unblendedcost.
- Common columns: "lineitem/unblendedcost", "lineitem/usagestartdate", "lineitem/resourceid", "lineitem/productcode", "product/productname", "bill/billingperiodstartdate".
- Tags live in the `raw_tags` JSON column. Use json_extract_scalar(raw_tags, '$.Environment') for simple keys and json_extract(raw_tags, '$["aws:eks:cluster-name"]') for keys with hyphens or colons (json_extract returns quoted strings).
- Filter dates with DATE('YYYY-MM-DD'). "Last month" means the previous calendar month relative to today.
- Example: SELECT "product/productname", SUM("lineitem/unblendedcost") AS cost FROM {table} WHERE "lineitem/usagestartdate" >= DATE('2025-01-01') GROUP BY "product/productname" ORDER BY cost DESC"#;

const CODE_GUIDANCE: &str = "# Code execution\n\
- execute_code runs Python or JavaScript in a fresh, empty directory with cloud credentials in \
the environment. Print results to stdout; anything written to disk is discarded.\n\
- Save programs worth repeating with save_workflow.";

/// Builds the system prompt for a turn. Only tools present in `tools` are mentioned;
/// `contexts` are rendered verbatim in the order given.
pub fn system_prompt(today: NaiveDate, tools: &[ToolSpec], contexts: &[ContextDocument]) -> String {
    let mut prompt = String::with_capacity(4096);
    prompt.push_str(PERSONA);
    let _ = write!(prompt, "\n\n# Current date\nToday is {} ({}).\n", today.format("%Y-%m-%d"), today.format("%B %Y"));
    prompt.push_str(
        "\n# Conversation\nYou remember earlier questions and answers of this conversation; \
         resolve follow-ups such as \"what about the others\" against them.\n",
    );
    push_contexts(&mut prompt, contexts);

    if tools.is_empty() {
        prompt.push_str("\nNo tools are available; answer from your own knowledge.\n");
        return prompt;
    }

    prompt.push_str("\n# Available tools\n");
    for tool in tools {
        let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description);
    }

    let offers = |kind: ToolKind| tools.iter().any(|tool| tool.name == kind.name());
    if offers(ToolKind::QueryCostData) {
        prompt.push_str("\nPrefer query_cost_data for cost questions; it has the most granular data.\n\n");
        prompt.push_str(CUR_GUIDANCE);
        prompt.push('\n');
    }
    if offers(ToolKind::CorrelateCostUtilization) {
        prompt.push_str(
            "\nFor rightsizing questions use correlate_cost_utilization and quote the potential savings.\n",
        );
    }
    if offers(ToolKind::ExecuteCode) {
        prompt.push('\n');
        prompt.push_str(CODE_GUIDANCE);
        prompt.push('\n');
    }
    prompt
}

fn push_contexts(prompt: &mut String, contexts: &[ContextDocument]) {
    if contexts.is_empty() {
        return;
    }
    prompt.push_str(
        "\n# Analyst context\nThe user attached the following reference material to this \
         message. Treat it as authoritative for names, owners and budgets.\n",
    );
    for context in contexts {
        let _ = writeln!(prompt, "\n## {}", context.name);
        if !context.description.is_empty() {
            let _ = writeln!(prompt, "{}", context.description);
        }
        let _ = writeln!(prompt, "\n{}\n\n---", context.content.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use finops_core::domain::context::{ContextDocument, ContextId};

    use super::system_prompt;
    use crate::tools::ToolKind;

    #[test]
    fn prompt_carries_the_date_and_only_offered_tools() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");
        let tools = vec![ToolKind::QueryCostData.spec(), ToolKind::ListWorkflows.spec()];
        let prompt = system_prompt(today, &tools, &[]);

        assert!(prompt.contains("Today is 2025-03-14 (March 2025)"));
        assert!(prompt.contains("{table}"));
        assert!(prompt.contains("- list_workflows:"));
        assert!(!prompt.contains("- execute_code:"));
        assert!(!prompt.contains("# Analyst context"));
    }

    #[test]
    fn attached_contexts_are_rendered_in_order() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");
        let document = |id: &str, name: &str, description: &str, content: &str| ContextDocument {
            id: ContextId(id.to_string()),
            name: name.to_string(),
            description: description.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let contexts = vec![
            document("ctx_b", "Budgets", "", "prod: $40k/month\n"),
            document("ctx_a", "Accounts", "Owner map", "111122223333 = payments-prod"),
        ];

        let prompt = system_prompt(today, &[], &contexts);

        assert!(prompt.contains("# Analyst context"));
        assert!(prompt.contains("## Accounts\nOwner map\n\n111122223333 = payments-prod"));
        let budgets = prompt.find("## Budgets").expect("budgets section");
        let accounts = prompt.find("## Accounts").expect("accounts section");
        assert!(budgets < accounts);
        assert!(prompt.contains("No tools are available"));
    }

    #[test]
    fn prompt_without_tools_says_so() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).expect("date");
        assert!(system_prompt(today, &[], &[]).contains("No tools are available"));
    }
}
