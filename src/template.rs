//! Instruction text sent to the model, and a check that replies keep the
//! six-section layout.

pub const SECTION_HEADINGS: [&str; 6] = [
    "### 1. App Overview",
    "### 2. Core Features",
    "### 3. User Stories",
    "### 4. Tech Stack Suggestions",
    "### 5. UI/UX Design Guidelines",
    "### 6. Data Model / Schema",
];

const ROLE: &str = "You are an expert software engineering project manager and prompt engineer.";

fn document_structure() -> String {
    format!(
        r#"
The prompt you generate MUST be structured with the following sections in Markdown format:

{}
A brief, high-level summary of the application's purpose and main goal.

{}
A detailed, numbered list of all the features described or implied. For each feature, explain what it does and how the user might interact with it.

{}
Write a few user stories in the format: "As a [user type], I want to [action] so that [benefit]." If the user type isn't specified, use a general persona like "As a user...".

{}
Based on the app's requirements, suggest a suitable tech stack. Default to a modern stack like Frontend: React with TypeScript and Tailwind CSS; Backend: Node.js with Express; Database: PostgreSQL, but adjust if the video implies other needs. Justify your choices briefly.

{}
Describe the visual style, color palette, and layout principles mentioned or shown. If not specified, suggest a modern, clean, and user-friendly design aesthetic (e.g., "minimalist with a dark theme and a single accent color").

{}
Propose a basic database schema or data model. Outline the main tables/collections, their fields (with types), and their relationships.

Your final output should be ONLY the generated prompt in clean Markdown. Do not include any of your own conversational text, greetings, or explanations before or after the prompt. Start directly with "{}".
"#,
        SECTION_HEADINGS[0],
        SECTION_HEADINGS[1],
        SECTION_HEADINGS[2],
        SECTION_HEADINGS[3],
        SECTION_HEADINGS[4],
        SECTION_HEADINGS[5],
        SECTION_HEADINGS[0],
    )
}

pub fn frames_instruction() -> String {
    format!(
        "{ROLE}
Analyze the following sequence of video frames. The user is describing or showing a concept for a web application they want to build.
Based on the visuals (like drawings, wireframes, existing apps, gestures) and any visible text in these frames, generate a comprehensive and detailed prompt that a developer could give to another AI to create this application.
{}",
        document_structure()
    )
}

pub fn video_url_instruction(url: &str) -> String {
    format!(
        "{ROLE}
A user has provided the following video URL: {url}
Your task is to use your search capabilities to understand the content of this video. Based on the video's topic, title, description, and likely content, infer the web application idea the user is trying to conceptualize. Then, generate a comprehensive and detailed prompt that a developer could give to another AI to create this application.
{}",
        document_structure()
    )
}

pub fn refine_instruction(original_prompt: &str, feedback: &str) -> String {
    let headings = SECTION_HEADINGS.join("\n");
    format!(
        r#"You are an expert prompt engineer. Your task is to refine an existing project prompt based on user feedback.
The user wants to modify the following prompt:

---
**ORIGINAL PROMPT:**
{original_prompt}
---

**USER'S REFINEMENT REQUEST:**
"{feedback}"

Your goal is to generate a new, complete prompt that incorporates the user's request.
You MUST maintain the exact same Markdown structure as the original prompt, keeping these headings verbatim and in this order:
{headings}

Do not add any conversational text, greetings, or explanations before or after the refined prompt. Output ONLY the complete, refined prompt in clean Markdown. Start directly with "{}".
"#,
        SECTION_HEADINGS[0]
    )
}

/// Level-3 headings of a Markdown document, in order of appearance.
pub fn section_headings(markdown: &str) -> Vec<&str> {
    markdown
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("### "))
        .collect()
}

/// True when all six expected headings appear, in order.
pub fn has_expected_structure(markdown: &str) -> bool {
    let headings = section_headings(markdown);
    let mut expected = SECTION_HEADINGS.iter().peekable();
    for heading in headings {
        if expected.peek().is_some_and(|next| **next == heading) {
            expected.next();
        }
    }
    expected.peek().is_none()
}
