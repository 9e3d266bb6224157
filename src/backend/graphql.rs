use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::{BackendEvent, GameBackend};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::{Game, GamePatch, Player, PlayerPatch};

const GAME_FIELDS: &str = "id code status hostId currentRound maxRounds gameType settings \
    timeRemaining roundStartTime currentLetters currentDrawing";
const PLAYER_FIELDS: &str = "id gameId name isHost score currentWords isConfirmed";

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlError {
    message: String,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    items: Vec<T>,
    #[serde(default)]
    next_token: Option<String>,
}

/// GraphQL-over-HTTP client for the managed game API.
///
/// Queries and mutations go over HTTP with an API key. Change notifications
/// are only produced for mutations made through this client; other clients'
/// changes arrive through the relay.
pub struct GraphQlBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    events: DashMap<String, broadcast::Sender<BackendEvent>>,
}

impl GraphQlBackend {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            policy,
            events: DashMap::new(),
        }
    }

    async fn post(&self, query: &str, variables: &Value) -> Result<Value> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(Error::Status {
                status: res.status().as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let body: GraphQlResponse = res.json().await?;
        if let Some(err) = body.errors.first() {
            let conditional = err
                .error_type
                .as_deref()
                .is_some_and(|t| t.contains("ConditionalCheckFailed"));
            return Err(if conditional {
                Error::ConditionFailed(err.message.clone())
            } else {
                Error::Backend(err.message.clone())
            });
        }
        body.data
            .ok_or_else(|| Error::Backend("response carried no data".to_string()))
    }

    /// Run an operation and decode `data.<field>`.
    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value, field: &str) -> Result<T> {
        let this = self;
        let variables = &variables;
        let data = self
            .policy
            .run(field, move || this.post(query, variables))
            .await?;
        take_field(data, field)
    }

    fn publish(&self, game_id: &str, event: BackendEvent) {
        if let Some(tx) = self.events.get(game_id) {
            let _ = tx.send(event);
        }
    }
}

/// Decode `data.<field>`; anything other than an object decodes as null.
fn take_field<T: DeserializeOwned>(mut data: Value, field: &str) -> Result<T> {
    let value = data.get_mut(field).map(Value::take).unwrap_or_default();
    Ok(serde_json::from_value(value)?)
}

fn patch_input<P: serde::Serialize>(id: &str, patch: &P) -> Result<Value> {
    let mut input = serde_json::to_value(patch)?;
    if let Value::Object(map) = &mut input {
        map.insert("id".to_string(), Value::String(id.to_string()));
    }
    Ok(input)
}

#[async_trait]
impl GameBackend for GraphQlBackend {
    async fn get_game(&self, id: &str) -> Result<Option<Game>> {
        let query = format!("query GetGame($id: ID!) {{ getGame(id: $id) {{ {GAME_FIELDS} }} }}");
        self.execute(&query, json!({ "id": id }), "getGame").await
    }

    async fn get_player(&self, id: &str) -> Result<Option<Player>> {
        let query = format!("query GetPlayer($id: ID!) {{ getPlayer(id: $id) {{ {PLAYER_FIELDS} }} }}");
        self.execute(&query, json!({ "id": id }), "getPlayer").await
    }

    async fn players_by_game_id(&self, game_id: &str) -> Result<Vec<Player>> {
        let query = format!(
            "query PlayersByGameId($gameId: ID!, $nextToken: String) {{ \
             playersByGameId(gameId: $gameId, nextToken: $nextToken) {{ items {{ {PLAYER_FIELDS} }} nextToken }} }}"
        );
        let mut players = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page: Page<Player> = self
                .execute(
                    &query,
                    json!({ "gameId": game_id, "nextToken": next_token }),
                    "playersByGameId",
                )
                .await?;
            players.extend(page.items);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(players)
    }

    async fn create_game(&self, game: &Game) -> Result<Game> {
        let query = format!(
            "mutation CreateGame($input: CreateGameInput!) {{ createGame(input: $input) {{ {GAME_FIELDS} }} }}"
        );
        self.execute(&query, json!({ "input": game }), "createGame").await
    }

    async fn create_player(&self, player: &Player) -> Result<Player> {
        let query = format!(
            "mutation CreatePlayer($input: CreatePlayerInput!) {{ createPlayer(input: $input) {{ {PLAYER_FIELDS} }} }}"
        );
        let created: Player = self
            .execute(&query, json!({ "input": player }), "createPlayer")
            .await?;
        self.publish(&created.game_id, BackendEvent::PlayerCreated(created.clone()));
        Ok(created)
    }

    async fn update_game(&self, id: &str, patch: &GamePatch) -> Result<Game> {
        let query = format!(
            "mutation UpdateGame($input: UpdateGameInput!) {{ updateGame(input: $input) {{ {GAME_FIELDS} }} }}"
        );
        let game: Game = self
            .execute(&query, json!({ "input": patch_input(id, patch)? }), "updateGame")
            .await?;
        self.publish(id, BackendEvent::GameUpdated(game.clone()));
        Ok(game)
    }

    async fn update_player(&self, id: &str, patch: &PlayerPatch) -> Result<Player> {
        let query = format!(
            "mutation UpdatePlayer($input: UpdatePlayerInput!) {{ updatePlayer(input: $input) {{ {PLAYER_FIELDS} }} }}"
        );
        let player: Player = self
            .execute(&query, json!({ "input": patch_input(id, patch)? }), "updatePlayer")
            .await?;
        self.publish(&player.game_id, BackendEvent::PlayerUpdated(player.clone()));
        Ok(player)
    }

    async fn claim_host(&self, game_id: &str, player_id: &str) -> Result<bool> {
        let query = format!(
            "mutation ClaimHost($input: UpdateGameInput!, $condition: ModelGameConditionInput) {{ \
             updateGame(input: $input, condition: $condition) {{ {GAME_FIELDS} }} }}"
        );
        let variables = json!({
            "input": { "id": game_id, "hostId": player_id },
            "condition": { "hostId": { "attributeExists": false } },
        });
        match self.execute::<Game>(&query, variables, "updateGame").await {
            Ok(game) => {
                self.publish(game_id, BackendEvent::GameUpdated(game));
                Ok(true)
            }
            Err(Error::ConditionFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self, game_id: &str) -> broadcast::Receiver<BackendEvent> {
        self.events
            .entry(game_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_input_carries_id_and_set_fields_only() {
        let patch = PlayerPatch {
            score: Some(4),
            ..Default::default()
        };
        let input = patch_input("p1", &patch).unwrap();
        assert_eq!(input, json!({ "id": "p1", "score": 4 }));
    }

    #[test]
    fn fields_of_odd_payloads_decode_as_missing() {
        let game: Option<Game> = take_field(json!({ "getGame": null }), "getGame").unwrap();
        assert!(game.is_none());
        let game: Option<Game> = take_field(json!([1, 2]), "getGame").unwrap();
        assert!(game.is_none());
        let game: Option<Game> = take_field(json!("oops"), "getGame").unwrap();
        assert!(game.is_none());
        assert!(take_field::<Game>(json!({}), "getGame").is_err());
    }

    #[test]
    fn page_decodes_without_token() {
        let page: Page<Player> = serde_json::from_value(json!({
            "items": [{ "id": "p1", "gameId": "ABCD", "name": "Ann" }]
        }))
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_token.is_none());
        assert_eq!(page.items[0].score, 0);
    }
}
