use serde_json::{Value, json};

pub fn openapi_spec() -> Value {
    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "lexstream Streaming API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Real-time agent execution events over WebSocket, with connection status and broadcast.",
        },
        "paths": {
            "/healthz": {
                "get": {
                    "summary": "Health check",
                    "responses": {
                        "200": {
                            "description": "Service health",
                            "content": {
                                "application/json": {
                                    "schema": {
                                        "type": "object",
                                        "required": ["status", "service", "engine"],
                                        "properties": {
                                            "status": { "type": "string" },
                                            "service": { "type": "string" },
                                            "engine": { "type": "string" },
                                        },
                                    },
                                },
                            },
                        },
                    },
                },
            },
            "/ws/query": {
                "get": {
                    "summary": "Open a query stream (WebSocket)",
                    "description": "Upgrade to WebSocket. The server greets with `connection_established`; each text frame sent by the client is a `QueryRequest`; each frame sent by the server is one `StreamEvent`. A query's events end with `agent_execution_complete` or `agent_execution_error`, followed by `ready_for_next_query`.",
                    "responses": {
                        "101": { "description": "Switching protocols" },
                    },
                },
            },
            "/ws/status": {
                "get": {
                    "summary": "Live connections",
                    "responses": {
                        "200": {
                            "description": "Point-in-time snapshot of connected clients",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/StatusReport" },
                                },
                            },
                        },
                    },
                },
            },
            "/ws/broadcast": {
                "post": {
                    "summary": "Broadcast a notice to every connected client",
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/BroadcastRequest" },
                            },
                        },
                    },
                    "responses": {
                        "200": {
                            "description": "Delivery report",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/BroadcastResponse" },
                                },
                            },
                        },
                        "400": {
                            "description": "Empty message",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/Error" },
                                },
                            },
                        },
                    },
                },
            },
            "/openapi.json": {
                "get": {
                    "summary": "OpenAPI document",
                    "responses": {
                        "200": {
                            "description": "OpenAPI 3.1 document",
                            "content": {
                                "application/json": {
                                    "schema": { "type": "object" },
                                },
                            },
                        },
                    },
                },
            },
            "/docs": {
                "get": {
                    "summary": "Interactive API reference",
                    "responses": {
                        "200": {
                            "description": "Scalar API reference UI",
                            "content": {
                                "text/html": {
                                    "schema": { "type": "string" },
                                },
                            },
                        },
                    },
                },
            },
        },
        "components": {
            "schemas": {
                "Error": {
                    "type": "object",
                    "required": ["error"],
                    "properties": {
                        "error": { "type": "string" },
                    },
                },
                "QueryRequest": {
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "query": { "type": "string", "minLength": 1, "maxLength": 4000 },
                        "case_id": { "type": ["integer", "null"], "minimum": 1 },
                        "stream_thinking": { "type": ["boolean", "null"], "default": true },
                    },
                },
                "StreamEvent": {
                    "type": "object",
                    "required": ["type", "timestamp"],
                    "properties": {
                        "type": {
                            "type": "string",
                            "description": "Event tag. Clients must tolerate tags they do not know.",
                            "examples": [
                                "connection_established",
                                "query_received",
                                "agent_execution_start",
                                "agent_start",
                                "tool_start",
                                "rag_query_end",
                                "agent_execution_complete",
                                "agent_execution_error",
                                "ready_for_next_query",
                            ],
                        },
                        "timestamp": { "type": "number", "description": "Seconds since UNIX epoch" },
                        "agent_name": { "type": "string" },
                        "task": { "type": "string" },
                        "action": { "type": "string" },
                        "tool_name": { "type": "string" },
                        "input_data": { "type": "object" },
                        "output_data": { "type": "object" },
                        "error": { "type": "string" },
                        "metadata": { "type": "object" },
                        "connection_id": { "type": "string" },
                        "message": { "type": "string" },
                    },
                },
                "ConnectionStatus": {
                    "type": "object",
                    "required": ["connection_id", "metadata"],
                    "properties": {
                        "connection_id": { "type": "string" },
                        "metadata": {
                            "type": "object",
                            "required": ["connected_at", "last_activity"],
                            "properties": {
                                "connected_at": { "type": "string", "format": "date-time" },
                                "last_activity": { "type": "string", "format": "date-time" },
                            },
                        },
                    },
                },
                "StatusReport": {
                    "type": "object",
                    "required": ["active_connections", "connections"],
                    "properties": {
                        "active_connections": { "type": "integer", "minimum": 0 },
                        "connections": {
                            "type": "array",
                            "items": { "$ref": "#/components/schemas/ConnectionStatus" },
                        },
                    },
                },
                "BroadcastRequest": {
                    "type": "object",
                    "required": ["message"],
                    "properties": {
                        "message": { "type": "string", "minLength": 1 },
                        "type": { "type": "string", "default": "info" },
                    },
                },
                "BroadcastResponse": {
                    "type": "object",
                    "required": ["message", "attempted", "delivered", "failed"],
                    "properties": {
                        "message": { "type": "string" },
                        "attempted": { "type": "integer", "minimum": 0 },
                        "delivered": { "type": "integer", "minimum": 0 },
                        "failed": { "type": "array", "items": { "type": "string" } },
                    },
                },
            },
        },
    })
}

pub fn scalar_docs_html(spec_url: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>lexstream API Docs</title>
    <style>
      html, body, #app {{
        margin: 0;
        padding: 0;
        height: 100%;
        width: 100%;
      }}
    </style>
  </head>
  <body>
    <div id="app"></div>
    <script src="https://cdn.jsdelivr.net/npm/@scalar/api-reference"></script>
    <script>
      Scalar.createApiReference('#app', {{
        url: '{spec_url}',
      }});
    </script>
  </body>
</html>
"#
    )
}
