//! Instruction prompt and output schema for menu extraction.
//!
//! Both extraction clients send exactly these, so a prompt change is one edit
//! and unit tests can inspect the schema without a live service.

use serde_json::{json, Value};

/// Name the JSON schema is registered under in structured-output requests.
pub const SCHEMA_NAME: &str = "menu_extraction";

/// Fixed instruction sent with every page image.
pub const EXTRACTION_PROMPT: &str = r#"You are digitising a restaurant menu. The image is one page of the menu.

Extract every orderable item you can read and return JSON only.

Rules:
1. Group items under the category heading they appear under on the page. If an item has no visible heading, use null for the category name.
2. name: the item name exactly as printed, without the price.
3. price: a number in major currency units (12.50, not "$12.50"). If several sizes are priced, use the smallest. If no price is printed, use 0 and a confidence at or below 0.5.
4. currency: ISO 4217 code inferred from symbols or the menu's locale. Use "XXX" when it cannot be determined.
5. description, allergens, tags: only what is printed on the page. Do not invent ingredients.
6. is_alcohol: true for beer, wine, spirits and cocktails.
7. confidence: 0 to 1, how sure you are that name and price are read correctly.
8. Ignore page numbers, addresses, opening hours and decorative text.

Output ONLY the JSON object. No markdown fences, no commentary."#;

/// Extra instruction for providers without native structured output.
const INLINE_SCHEMA_PREAMBLE: &str = "Your reply must validate against this JSON schema:";

/// JSON schema for one page's extraction payload.
///
/// Strict mode requires every property to be listed in `required`, so
/// optional fields are expressed as nullable types instead.
pub fn extraction_schema() -> Value {
    let item = json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["name", "description", "price", "currency", "allergens", "is_alcohol", "tags", "confidence"],
        "properties": {
            "name": { "type": "string" },
            "description": { "type": ["string", "null"] },
            "price": { "type": "number", "minimum": 0 },
            "currency": { "type": "string", "minLength": 3, "maxLength": 3 },
            "allergens": { "type": ["array", "null"], "items": { "type": "string" } },
            "is_alcohol": { "type": ["boolean", "null"] },
            "tags": { "type": ["array", "null"], "items": { "type": "string" } },
            "confidence": { "type": ["number", "null"], "minimum": 0, "maximum": 1 }
        }
    });

    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["currency", "categories"],
        "properties": {
            "currency": { "type": "string", "minLength": 3, "maxLength": 3 },
            "categories": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name", "items"],
                    "properties": {
                        "name": { "type": ["string", "null"] },
                        "items": { "type": "array", "items": item }
                    }
                }
            }
        }
    })
}

/// System prompt for chat providers: the instructions plus the schema inline.
pub fn chat_system_prompt() -> String {
    format!(
        "{}\n\n{}\n{}",
        EXTRACTION_PROMPT,
        INLINE_SCHEMA_PREAMBLE,
        extraction_schema()
    )
}
