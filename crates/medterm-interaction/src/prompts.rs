//! Prompt templates for the LLM calls.
//!
//! These are consumed as-is by the agents and the concept-set workflow; the
//! data placed into them is always search-derived, never user-controlled
//! markup.

/// Classifies whether a query asks for a concept set. Expects "True"/"False".
pub fn classification_prompt(query: &str) -> String {
    format!(
        r#"You are an expert at classifying user intent. Your task is to determine if the user's query is asking to create, generate, or find a "concept set".
A "concept set" is a group of medical codes (like ICD-10) related to a specific clinical idea, such as "Diabetes" or "Heart Failure".

Respond with "True" if the query is about creating a concept set.
Respond with "False" if the query is about anything else.

User Query: "{query}""#
    )
}

/// Renders extracted concept records into the user's requested format.
pub fn formatting_prompt(query: &str, context_data: &str) -> String {
    format!(
        r#"You are a helpful AI assistant. Your task is to format the provided data into a clear and readable format based on the user's original request.
The data you are given is the only source of information you should use for ICD codes and their descriptions. Do not add any information that is not in the provided data.

User's original request: "{query}"
Data to format:
---
{context_data}
---

Based on the user's request, present the data in the best possible format.
If the user asks for a table, create a markdown table.
If the user does not specify a format, default to a markdown table with "Code" and "Description" columns."#
    )
}

/// Extracts the primary medical condition from a query.
pub fn condition_extraction_prompt(query: &str) -> String {
    format!(
        r#"Extract the PRIMARY medical condition from this query.

Query: "{query}"

RETURN ONLY THE MAIN MEDICAL CONDITION (2-4 words). Do not include:
- "concept set", "codes", "ICD", "SNOMED"
- Action words like "create", "show", "find"

Examples:
- "Create diabetes concept set" -> diabetes
- "Show hypertension ICD codes" -> hypertension
- "Chronic pain with comorbidities" -> chronic pain

Primary condition:"#
    )
}

/// Expands a condition to related and causative terms, comma-separated.
pub fn condition_expansion_prompt(condition: &str) -> String {
    format!(
        r#"You are a medical terminology expert. For the given medical condition, identify RELATED and CAUSATIVE conditions that should be included in a comprehensive search.

Primary Condition: "{condition}"

Identify:
1. Common synonyms and abbreviations
2. Specific types/subtypes of this condition
3. Conditions that commonly CAUSE this condition
4. Related conditions that often co-occur

IMPORTANT RULES:
- Include 3-8 related terms (don't be excessive)
- Use standard medical terminology
- Focus on clinically relevant relationships
- Each term should be 1-4 words maximum

Examples:

Input: "diabetes"
Output: diabetes, diabetic, type 1 diabetes, type 2 diabetes, gestational diabetes, DM

Input: "chronic pain"
Output: chronic pain, fibromyalgia, arthritis, neuropathic pain, musculoskeletal pain, back pain

Input: "heart failure"
Output: heart failure, cardiac failure, CHF, congestive heart failure, systolic heart failure, diastolic heart failure

Now provide ONLY the comma-separated list of related terms for: "{condition}"

Output:"#
    )
}

/// System prompt for ICD search answers with `[CODE]` citations.
pub const ICD_SYSTEM_PROMPT: &str = "You are an expert medical coding assistant specializing in ICD codes. \
Provide accurate, helpful responses about ICD codes based on the search results provided. \
When referencing specific ICD codes, use the document ID in square brackets like [I10] for citations. \
Base your responses only on the provided search results.";

/// User prompt pairing a query with formatted ICD search results.
pub fn icd_user_prompt(query: &str, context: &str) -> String {
    format!(
        "User Query: {query}\n\nSearch Results:\n{context}\n\n\
         Please provide a comprehensive response about the ICD codes relevant to this query. \
         Include citations using document IDs in square brackets (e.g., [I10]) when referencing specific codes."
    )
}

/// System prompt for SNOMED search answers with numbered citations.
pub const SNOMED_SYSTEM_PROMPT: &str = "You are an expert in SNOMED CT clinical terminology. \
The SNOMED concepts provided in the context are the authoritative and only source of information; \
do not add, infer, or supplement with external knowledge.\n\n\
MANDATORY RULES:\n\
1. Use ONLY information from the provided SNOMED concepts\n\
2. Always cite sources using [1], [2], etc. corresponding to document numbers\n\
3. Never add concepts, codes, or information not in the provided data\n\
4. If asked about concepts not in the results, explicitly state \"Not found in search results\"\n\
5. Do not make assumptions about relationships or hierarchies not explicitly shown";

/// User prompt pairing a query with formatted SNOMED concepts.
pub fn snomed_user_prompt(query: &str, context: &str) -> String {
    format!(
        "Based on the following SNOMED CT concepts, answer this query: \"{query}\"\n\n\
         SNOMED Concepts Found:\n{context}\n\n\
         FORMATTING RULES:\n\
         - Never use HTML tags; when listing multiple codes, separate them with commas\n\
         - Use markdown only (**, *, -, |) for emphasis and tables\n\
         - When asked to add/remove columns or show a table, rebuild the entire table in markdown\n\n\
         Provide a comprehensive answer with citations [1], [2], etc."
    )
}

/// System prompt for the chat agent when session data is available.
pub fn chat_context_system_prompt(context: &str, code_count: usize) -> String {
    format!(
        r#"You are a helpful AI assistant specializing in medical coding and ICD-10 codes.

You have access to {code_count} codes from a previous search below. This is your COMPLETE dataset; use ONLY this data and never ask the user to provide it again.

SNOMED DATA SOURCE PRIORITY:
1. Items with metadata "source": "SNOMED_AGENT" are the authoritative SNOMED data
2. OHDSI field mappings are correlation data only; use them as a fallback

AVAILABLE CODES WITH ALL FIELDS ({code_count} codes):
{context}

RULES:
1. Never ask the user to provide data - everything you need is above
2. Format the data as requested (table, JSON, list); do not add codes not in the list
3. If asked about codes not in the list, state they are not in the current dataset
4. When modifying a table (add/remove columns, filter rows), rebuild the ENTIRE table in markdown and output only the table
5. Never use HTML tags; separate multiple codes with commas and use markdown pipes for tables"#
    )
}

/// Default system prompt for the chat agent without session context.
pub const CHAT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Instructions for rebuilding a concept-set table after a modification.
pub fn modification_prompt(original_query: &str, raw_data: &str, request: &str) -> String {
    format!(
        r#"CONCEPT SET MODIFICATION TASK

Original Query: {original_query}

AVAILABLE CONCEPT SET DATA (ALL CODES):
{raw_data}

INSTRUCTIONS FOR MODIFICATION:
1. The data above contains ALL codes from the original concept set
2. Parse each line to extract: Code, Label, Score and any other fields
3. Apply the user's modification request (remove, filter, add columns, etc.)
4. When REMOVING codes: filter out ONLY the specified codes, keep all others
5. Rebuild the COMPLETE table with modifications applied, in the same markdown format
6. Include ALL codes that were not removed; never truncate or show examples only

User's Modification Request: {request}

Now generate the COMPLETE modified concept set table with ALL remaining codes:"#
    )
}

/// System prompt for hierarchy answers.
pub const HIERARCHY_SYSTEM_PROMPT: &str = "You are an expert medical coding assistant specializing in ICD code hierarchies and relationships. \
Provide clear, accurate responses about code hierarchies based on the relationship data provided. \
When referencing specific codes, use the document ID in square brackets like [I10] for citations.";

/// User prompt pairing a query with hierarchy data.
pub fn hierarchy_user_prompt(query: &str, context: &str) -> String {
    format!(
        "User Query: {query}\n\nHierarchy Data:\n{context}\n\n\
         Please provide a comprehensive response about the code hierarchy and relationships. \
         Include citations using document IDs in square brackets."
    )
}

/// System prompt for ICD-to-SNOMED mapping answers.
pub const MAPPING_SYSTEM_PROMPT: &str = "You are an expert medical coding assistant specializing in SNOMED and ICD code mappings. \
Provide clear, accurate responses about code mappings and relationships based on the mapping data provided. \
When referencing specific codes, use the document ID in square brackets like [I10] for citations.";

/// User prompt pairing a query with mapping data.
pub fn mapping_user_prompt(query: &str, context: &str) -> String {
    format!(
        "User Query: {query}\n\nSNOMED Mapping Data:\n{context}\n\n\
         Please provide a comprehensive response about the SNOMED mappings and relationships. \
         Include citations using document IDs in square brackets."
    )
}

/// System prompt for general relationship answers.
pub const RELATIONSHIP_SYSTEM_PROMPT: &str = "You are an expert medical coding assistant specializing in medical code relationships. \
Provide clear, accurate responses about code relationships based on the relationship data provided. \
When referencing specific codes, use the document ID in square brackets like [I10] for citations.";

/// User prompt pairing a query with general relationship data.
pub fn relationship_user_prompt(query: &str, context: &str) -> String {
    format!(
        "User Query: {query}\n\nRelationship Data:\n{context}\n\n\
         Please provide a comprehensive response about the code relationships. \
         Include citations using document IDs in square brackets."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_filled() {
        let prompt = classification_prompt("create a diabetes concept set");
        assert!(prompt.contains("create a diabetes concept set"));
        assert!(!prompt.contains("{query}"));

        let prompt = formatting_prompt("show a table", "Code: I10");
        assert!(prompt.contains("show a table"));
        assert!(prompt.contains("Code: I10"));

        let prompt = modification_prompt("diabetes codes", "Code: E11", "remove E11.9");
        assert!(prompt.contains("remove E11.9"));
        assert!(prompt.contains("Code: E11"));
    }
}
