use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::types::Property;

/// Baserow tabular storage: one table of leads, one of properties, always
/// addressed with `user_field_names=true` so rows read/write by column name.
#[derive(Clone)]
pub struct BaserowClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    leads_table_id: String,
    properties_table_id: String,
}

fn cell_text(row: &Value, field: &str) -> String {
    match row.get(field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Object(obj)) => obj
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Photo cells come either as a Baserow file field (array of objects with a
/// `url`) or as a free-text cell of newline/comma separated links.
fn cell_photos(row: &Value, field: &str) -> Vec<String> {
    match row.get(field) {
        Some(Value::Array(files)) => files
            .iter()
            .filter_map(|file| file.get("url").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
        Some(Value::String(raw)) => raw
            .split(|c| c == '\n' || c == ',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn row_active(row: &Value) -> bool {
    match row.get("Ativo") {
        Some(Value::Bool(active)) => *active,
        Some(Value::String(s)) => !s.trim().eq_ignore_ascii_case("false"),
        _ => true,
    }
}

pub fn property_from_row(row: &Value) -> Property {
    Property {
        id: row
            .get("id")
            .map(|id| match id {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => String::new(),
            })
            .unwrap_or_default(),
        title: cell_text(row, "Título"),
        price: cell_text(row, "Preço"),
        property_type: cell_text(row, "Tipo"),
        category: cell_text(row, "Categoria"),
        location: cell_text(row, "Localização"),
        city: cell_text(row, "Cidade"),
        neighborhood: cell_text(row, "Bairro"),
        bedrooms: cell_text(row, "Quartos"),
        bathrooms: cell_text(row, "Banheiros"),
        area: cell_text(row, "Área"),
        description: cell_text(row, "Descrição"),
        photos: cell_photos(row, "Fotos"),
    }
}

impl BaserowClient {
    pub fn from_config(http: reqwest::Client, config: &AppConfig) -> Option<Self> {
        if !config.baserow_configured() {
            return None;
        }
        Some(Self {
            http,
            base_url: config.baserow_api_url.clone(),
            token: config.baserow_api_token.clone(),
            leads_table_id: config.baserow_leads_table_id.clone(),
            properties_table_id: config.baserow_properties_table_id.clone(),
        })
    }

    #[cfg(test)]
    pub fn for_tests(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: "test-token".to_string(),
            leads_table_id: "101".to_string(),
            properties_table_id: "102".to_string(),
        }
    }

    fn rows_url(&self, table_id: &str) -> String {
        format!("{}/api/database/rows/table/{}/", self.base_url, table_id)
    }

    async fn list_rows(&self, table_id: &str, filters: &[(&str, &str)]) -> Result<Vec<Value>, String> {
        let mut query: Vec<(&str, String)> = vec![
            ("user_field_names", "true".to_string()),
            ("size", "200".to_string()),
        ];
        for (name, value) in filters {
            query.push((name, value.to_string()));
        }
        let response = self
            .http
            .get(self.rows_url(table_id))
            .header("Authorization", format!("Token {}", self.token))
            .query(&query)
            .send()
            .await
            .map_err(|err| format!("baserow request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("baserow returned {status}: {body}"));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("baserow parse failed: {err}"))?;
        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn find_lead_by_phone(&self, phone: &str) -> Result<Option<Value>, String> {
        let rows = self
            .list_rows(&self.leads_table_id, &[("filter__Telefone__equal", phone)])
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn create_lead(&self, fields: Value) -> Result<Value, String> {
        let response = self
            .http
            .post(self.rows_url(&self.leads_table_id))
            .header("Authorization", format!("Token {}", self.token))
            .query(&[("user_field_names", "true")])
            .json(&fields)
            .send()
            .await
            .map_err(|err| format!("baserow create failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("baserow create returned {status}: {body}"));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| format!("baserow create parse failed: {err}"))
    }

    pub async fn patch_lead(&self, row_id: i64, fields: Value) -> Result<Value, String> {
        let url = format!("{}{}/", self.rows_url(&self.leads_table_id), row_id);
        let response = self
            .http
            .patch(&url)
            .header("Authorization", format!("Token {}", self.token))
            .query(&[("user_field_names", "true")])
            .json(&fields)
            .send()
            .await
            .map_err(|err| format!("baserow patch failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("baserow patch returned {status}: {body}"));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| format!("baserow patch parse failed: {err}"))
    }

    /// Upsert keyed by phone number, never by row id: a second create for a
    /// known number resolves to a patch. Name and email cells are only
    /// written when the stored cell is empty.
    pub async fn upsert_lead(&self, phone: &str, fields: Value) -> Result<Value, String> {
        let existing = self.find_lead_by_phone(phone).await?;
        let Some(row) = existing else {
            let mut create_fields = fields;
            create_fields["Telefone"] = json!(phone);
            return self.create_lead(create_fields).await;
        };

        let row_id = row.get("id").and_then(Value::as_i64).unwrap_or_default();
        let mut patch = serde_json::Map::new();
        if let Some(obj) = fields.as_object() {
            for (name, value) in obj {
                let guarded = name == "Nome" || name == "Email";
                if guarded && !cell_text(&row, name).is_empty() {
                    continue;
                }
                patch.insert(name.clone(), value.clone());
            }
        }
        if patch.is_empty() {
            return Ok(row);
        }
        self.patch_lead(row_id, Value::Object(patch)).await
    }

    /// Property rows whose active flag is not explicitly false.
    pub async fn list_active_properties(&self) -> Result<Vec<Property>, String> {
        let rows = self.list_rows(&self.properties_table_id, &[]).await?;
        Ok(rows
            .iter()
            .filter(|row| row_active(row))
            .map(property_from_row)
            .collect())
    }
}

/// Reduced projection of the catalog for the LLM prompt.
pub fn format_properties_for_prompt(properties: &[Property]) -> String {
    let mut out = String::new();
    for (index, property) in properties.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} (código {})\n   Preço: {} | Tipo: {} | Categoria: {}\n   Local: {}{}{}\n   Quartos: {} | Banheiros: {} | Área: {}\n   {}\n",
            index + 1,
            property.title,
            property.id,
            property.price,
            property.property_type,
            property.category,
            property.location,
            if property.neighborhood.is_empty() {
                String::new()
            } else {
                format!(", {}", property.neighborhood)
            },
            if property.city.is_empty() {
                String::new()
            } else {
                format!(" - {}", property.city)
            },
            property.bedrooms,
            property.bathrooms,
            property.area,
            property.description,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn property_row(id: i64, title: &str, active: Value) -> Value {
        json!({
            "id": id,
            "Título": title,
            "Preço": "R$ 450.000",
            "Tipo": "Casa",
            "Categoria": "Venda",
            "Localização": "Centro",
            "Cidade": "Gramado",
            "Bairro": "Centro",
            "Quartos": 3,
            "Banheiros": 2,
            "Área": "120m²",
            "Descrição": "Casa ampla",
            "Fotos": "https://site/img1.jpg\nhttps://site/img2.jpg",
            "Ativo": active
        })
    }

    #[tokio::test]
    async fn active_listing_excludes_explicitly_inactive_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/database/rows/table/102/"))
            .and(query_param("user_field_names", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    property_row(1, "Casa Centro", json!(true)),
                    property_row(2, "Apto Bavária", json!(false)),
                    property_row(3, "Sítio Linha Nova", Value::Null),
                ]
            })))
            .mount(&server)
            .await;

        let client = BaserowClient::for_tests(reqwest::Client::new(), &server.uri());
        let properties = client.list_active_properties().await.unwrap();
        let titles: Vec<&str> = properties.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Casa Centro", "Sítio Linha Nova"]);
        assert_eq!(properties[0].photos.len(), 2);
    }

    #[tokio::test]
    async fn upsert_patches_existing_row_and_keeps_filled_name_and_email() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/database/rows/table/101/"))
            .and(query_param("filter__Telefone__equal", "5511988887777"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "id": 7,
                    "Telefone": "5511988887777",
                    "Nome": "Maria Silva",
                    "Email": "maria@exemplo.com",
                    "Score": 40
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/database/rows/table/101/7/"))
            .and(body_partial_json(json!({ "Score": 85 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7,
                "Score": 85
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = BaserowClient::for_tests(reqwest::Client::new(), &server.uri());
        let patched = client
            .upsert_lead(
                "5511988887777",
                json!({ "Nome": "Outro Nome", "Email": "outro@x.com", "Score": 85 }),
            )
            .await
            .unwrap();
        assert_eq!(patched["Score"], 85);

        // The guarded cells must not appear in the patch body.
        let requests = server.received_requests().await.unwrap();
        let patch_request = requests
            .iter()
            .find(|r| r.method.to_string().eq_ignore_ascii_case("PATCH"))
            .unwrap();
        let body: Value = serde_json::from_slice(&patch_request.body).unwrap();
        assert!(body.get("Nome").is_none());
        assert!(body.get("Email").is_none());
    }

    #[tokio::test]
    async fn upsert_creates_when_no_row_matches_the_phone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/database/rows/table/101/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/database/rows/table/101/"))
            .and(body_partial_json(json!({ "Telefone": "5511988887777" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 12 })))
            .expect(1)
            .mount(&server)
            .await;

        let client = BaserowClient::for_tests(reqwest::Client::new(), &server.uri());
        let created = client
            .upsert_lead("5511988887777", json!({ "Nome": "Maria", "Score": 10 }))
            .await
            .unwrap();
        assert_eq!(created["id"], 12);
    }

    #[test]
    fn prompt_projection_numbers_properties_and_includes_code() {
        let properties = vec![property_from_row(&property_row(9, "Casa Centro", json!(true)))];
        let formatted = format_properties_for_prompt(&properties);
        assert!(formatted.starts_with("1. Casa Centro (código 9)"));
        assert!(formatted.contains("R$ 450.000"));
        assert!(formatted.contains("Quartos: 3"));
    }
}
