use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RecipeId);

/// How collections recognise "the same" recipe across inserts.
///
/// Recipes carrying an id are keyed by it. Legacy records and payloads
/// without an id fall back to their title.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
    Id(RecipeId),
    Title(String),
}

impl IdentityKey {
    pub fn title(title: impl Into<String>) -> Self {
        Self::Title(title.into())
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(RecipeId::new(id))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Title(title) => write!(f, "title:{title}"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipeStep {
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl RecipeStep {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            image_url: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NutritionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<String>,
}

/// A generated or curated recipe.
///
/// Immutable once stored, except for `tags`, which the tag operations of the
/// owning collection mutate in place.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecipeId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_servings")]
    pub servings: u32,
    #[serde(default)]
    pub prep_time: String,
    #[serde(default)]
    pub cook_time: String,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hero_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nutrition_info: Option<NutritionInfo>,
    /// Display order is insertion order; casing is preserved.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Recipe {
    /// Builds an id-less recipe; its identity falls back to the title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: String::new(),
            servings: 0,
            prep_time: String::new(),
            cook_time: String::new(),
            ingredients: Vec::new(),
            steps: Vec::new(),
            hero_image: None,
            nutrition_info: None,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: RecipeId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        match &self.id {
            Some(id) if !id.as_str().trim().is_empty() => IdentityKey::Id(id.clone()),
            _ => IdentityKey::Title(self.title.clone()),
        }
    }

    /// Every remote image this recipe renders, hero first.
    #[must_use]
    pub fn image_uris(&self) -> Vec<String> {
        self.hero_image
            .iter()
            .cloned()
            .chain(self.steps.iter().filter_map(|s| s.image_url.clone()))
            .collect()
    }

    /// Parses and validates a payload returned by the generation service.
    pub fn from_generated(payload: serde_json::Value) -> Result<Self, RecipeValidationError> {
        let mut recipe: Recipe = serde_json::from_value(payload)
            .map_err(|e| RecipeValidationError::Malformed(e.to_string()))?;

        recipe.title = recipe.title.trim().to_string();
        if recipe.title.is_empty() {
            return Err(RecipeValidationError::MissingTitle);
        }

        recipe.ingredients.retain(|i| !i.trim().is_empty());
        if recipe.ingredients.is_empty() {
            return Err(RecipeValidationError::NoIngredients);
        }

        recipe.steps.retain(|s| !s.instruction.trim().is_empty());
        if recipe.steps.is_empty() {
            return Err(RecipeValidationError::NoSteps);
        }

        recipe.tags = normalize_tags(recipe.tags);
        Ok(recipe)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecipeValidationError {
    #[error("malformed recipe payload: {0}")]
    Malformed(String),
    #[error("recipe has no title")]
    MissingTitle,
    #[error("recipe has no ingredients")]
    NoIngredients,
    #[error("recipe has no steps")]
    NoSteps,
}

/// Case-insensitive tag comparison.
#[must_use]
pub fn tag_matches(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Drops blank tags and case-insensitive duplicates, keeping the first casing seen.
#[must_use]
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if tag.is_empty() || out.iter().any(|t| tag_matches(t, &tag)) {
            continue;
        }
        out.push(tag);
    }
    out
}

fn lenient_servings<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Servings {
        Number(u32),
        Text(String),
    }

    match Servings::deserialize(deserializer)? {
        Servings::Number(n) => Ok(n),
        Servings::Text(s) => Ok(s
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0)),
    }
}
