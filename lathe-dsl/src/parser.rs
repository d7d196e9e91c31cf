//! Pipeline parser
//!
//! Recursive-descent parser over the token stream produced by the lexer:
//!
//! ```text
//! Pipeline   := "pipeline" "{" "agent" Agent Stages "}"
//! Agent      := "none" | "{" "docker" String "}"
//! Stages     := "stages" "{" Stage+ "}"
//! Stage      := "stage" "(" String ")" "{" ["agent" Agent] [Steps] [FailFast] [Parallel] "}"
//! Steps      := "steps" "{" Step+ "}"
//! Step       := Ident String | Ident Param ("," Param)*
//! Param      := Ident ":" String
//! FailFast   := "failFast" Bool
//! Parallel   := "parallel" "{" Stage+ "}"
//! ```
//!
//! Parsing is pure: the same text always yields the same AST.

use lathe_core::domain::pipeline::{Agent, Param, Pipeline, Stage, Step};
use tracing::debug;

use crate::error::{ParseError, Result};
use crate::lexer::{Keyword, Token, TokenKind, tokenize};

/// Parse a pipeline script into its AST
///
/// # Arguments
/// * `source` - The pipeline script text
///
/// # Returns
/// The parsed pipeline
///
/// # Errors
/// Returns an error if:
/// - The text contains characters no token rule matches
/// - A token does not fit the grammar, or a block is left open
/// - The document has an empty stage name
///
/// # Example
/// ```
/// use lathe_dsl::parse_pipeline;
///
/// let pipeline = parse_pipeline(
///     "pipeline { agent none stages { stage('Test') { steps { sh 'node --version' } } } }",
/// )?;
/// assert_eq!(pipeline.stages[0].name, "Test");
/// # Ok::<(), lathe_dsl::ParseError>(())
/// ```
pub fn parse_pipeline(source: &str) -> Result<Pipeline> {
    let tokens = tokenize(source)?;
    let pipeline = Parser::new(tokens).pipeline()?;

    pipeline.validate().map_err(ParseError::Invalid)?;

    debug!("Parsed pipeline with {} stage(s)", pipeline.stages.len());
    Ok(pipeline)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_second(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| &t.kind)
    }

    fn next_token(&mut self, expected: &str) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ParseError::UnexpectedEof {
                expected: expected.to_string(),
            })?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(expected: &str, token: &Token) -> ParseError {
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: token.kind.to_string(),
            line: token.line,
            column: token.column,
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        let expected = kind.to_string();
        let token = self.next_token(&expected)?;
        if token.kind != kind {
            return Err(Self::unexpected(&expected, &token));
        }
        Ok(())
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<()> {
        self.expect(TokenKind::Keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.peek() == Some(&TokenKind::Keyword(keyword)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let token = self.next_token(what)?;
        match token.kind {
            TokenKind::String(value) => Ok(value),
            _ => Err(Self::unexpected(what, &token)),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        let token = self.next_token(what)?;
        match token.kind {
            TokenKind::Ident(name) => Ok(name),
            _ => Err(Self::unexpected(what, &token)),
        }
    }

    fn pipeline(&mut self) -> Result<Pipeline> {
        self.expect_keyword(Keyword::Pipeline)?;
        self.expect(TokenKind::LBrace)?;
        self.expect_keyword(Keyword::Agent)?;
        let agent = self.agent()?;
        let stages = self.stages()?;
        self.expect(TokenKind::RBrace)?;

        if let Some(token) = self.tokens.get(self.pos) {
            return Err(Self::unexpected("end of input", token));
        }

        Ok(Pipeline { agent, stages })
    }

    fn agent(&mut self) -> Result<Agent> {
        let token = self.next_token("agent 'none' or '{'")?;
        match token.kind {
            TokenKind::Keyword(Keyword::None) => Ok(Agent::None),
            TokenKind::LBrace => {
                self.expect_keyword(Keyword::Docker)?;
                let image = self.string("docker image string")?;
                self.expect(TokenKind::RBrace)?;
                Ok(Agent::Docker { image })
            }
            _ => Err(Self::unexpected("agent 'none' or '{'", &token)),
        }
    }

    fn stages(&mut self) -> Result<Vec<Stage>> {
        self.expect_keyword(Keyword::Stages)?;
        self.stage_block()
    }

    /// `"{" Stage+ "}"`, shared by `stages` and `parallel`
    fn stage_block(&mut self) -> Result<Vec<Stage>> {
        self.expect(TokenKind::LBrace)?;

        let mut stages = vec![self.stage()?];
        while self.peek() == Some(&TokenKind::Keyword(Keyword::Stage)) {
            stages.push(self.stage()?);
        }

        self.expect(TokenKind::RBrace)?;
        Ok(stages)
    }

    fn stage(&mut self) -> Result<Stage> {
        self.expect_keyword(Keyword::Stage)?;
        self.expect(TokenKind::LParen)?;
        let name = self.string("stage name string")?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;

        let agent = if self.eat_keyword(Keyword::Agent) {
            Some(self.agent()?)
        } else {
            None
        };

        let steps = if self.eat_keyword(Keyword::Steps) {
            self.steps()?
        } else {
            Vec::new()
        };

        let fail_fast = if self.eat_keyword(Keyword::FailFast) {
            let token = self.next_token("boolean")?;
            match token.kind {
                TokenKind::Bool(value) => Some(value),
                _ => return Err(Self::unexpected("boolean", &token)),
            }
        } else {
            None
        };

        let parallel = if self.eat_keyword(Keyword::Parallel) {
            self.stage_block()?
        } else {
            Vec::new()
        };

        self.expect(TokenKind::RBrace)?;

        Ok(Stage {
            name,
            agent,
            steps,
            fail_fast,
            parallel,
        })
    }

    fn steps(&mut self) -> Result<Vec<Step>> {
        self.expect(TokenKind::LBrace)?;

        let mut steps = vec![self.step()?];
        while matches!(self.peek(), Some(TokenKind::Ident(_))) {
            steps.push(self.step()?);
        }

        self.expect(TokenKind::RBrace)?;
        Ok(steps)
    }

    fn step(&mut self) -> Result<Step> {
        let command = self.ident("step command")?;

        if matches!(self.peek(), Some(TokenKind::String(_))) {
            let value = self.string("step value")?;
            return Ok(Step::SingleKV { command, value });
        }

        let mut params = vec![self.param()?];
        while self.peek() == Some(&TokenKind::Comma) {
            self.pos += 1;
            params.push(self.param()?);
        }

        Ok(Step::MultiKV { command, params })
    }

    fn param(&mut self) -> Result<Param> {
        // A bare identifier not followed by ':' is the start of the next step
        if !matches!(self.peek_second(), Some(TokenKind::Colon))
            && matches!(self.peek(), Some(TokenKind::Ident(_)))
        {
            let token = self.next_token("parameter")?;
            return Err(Self::unexpected("string or 'key: value' parameter", &token));
        }

        let key = self.ident("string or 'key: value' parameter")?;
        self.expect(TokenKind::Colon)?;
        let value = self.string("parameter value string")?;
        Ok(Param { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(value: &str) -> Step {
        Step::SingleKV {
            command: "sh".to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_parse_single_step() {
        let source = r#"
            pipeline {
                agent none
                stages {
                    stage('Test') {
                        steps {
                            sh 'node --version'
                        }
                    }
                }
            }
        "#;

        let pipeline = parse_pipeline(source).unwrap();
        assert_eq!(
            pipeline,
            Pipeline {
                agent: Agent::None,
                stages: vec![Stage {
                    name: "Test".to_string(),
                    steps: vec![sh("node --version")],
                    ..Default::default()
                }],
            }
        );
    }

    #[test]
    fn test_parse_docker_agent_and_multi_kv() {
        let source = r#"
            pipeline {
                agent none
                stages {
                    stage('Example Build') {
                        agent { docker 'maven:3.9.3-eclipse-temurin-17' }
                        steps {
                            echo 'Hello, Maven'
                            sh 'mvn --version'
                            git branch: 'main',
                                credentialsId: '12345',
                                url: 'https://x/y.git'
                        }
                    }
                }
            }
        "#;

        let pipeline = parse_pipeline(source).unwrap();
        let stage = &pipeline.stages[0];
        assert_eq!(stage.name, "Example Build");
        assert_eq!(
            stage.agent,
            Some(Agent::Docker {
                image: "maven:3.9.3-eclipse-temurin-17".to_string()
            })
        );
        assert_eq!(stage.steps.len(), 3);
        assert_eq!(
            stage.steps[0],
            Step::SingleKV {
                command: "echo".to_string(),
                value: "Hello, Maven".to_string(),
            }
        );
        assert_eq!(stage.steps[1], sh("mvn --version"));

        let (command, params) = stage.steps[2].to_command();
        assert_eq!(command, "git");
        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("branch", "main"),
                ("credentialsId", "12345"),
                ("url", "https://x/y.git"),
            ]
        );
    }

    #[test]
    fn test_parse_parallel_with_fail_fast() {
        let source = r#"
            pipeline {
                agent { docker "node:20" }
                stages {
                    stage('Build') {
                        steps { sh 'npm ci' }
                    }
                    stage('Checks') {
                        failFast true
                        parallel {
                            stage('Branch A') {
                                steps { sh 'npm run lint' }
                            }
                            stage('Branch B') {
                                agent none
                                steps { sh 'npm test' }
                            }
                        }
                    }
                }
            }
        "#;

        let pipeline = parse_pipeline(source).unwrap();
        assert_eq!(
            pipeline.agent,
            Agent::Docker {
                image: "node:20".to_string()
            }
        );
        assert_eq!(pipeline.stages.len(), 2);

        let checks = &pipeline.stages[1];
        assert_eq!(checks.fail_fast, Some(true));
        assert!(checks.steps.is_empty());
        assert_eq!(checks.parallel.len(), 2);
        assert_eq!(checks.parallel[0].name, "Branch A");
        assert_eq!(checks.parallel[1].name, "Branch B");
        assert_eq!(checks.parallel[1].agent, Some(Agent::None));
    }

    #[test]
    fn test_parse_stage_with_steps_and_parallel() {
        let source = "pipeline { agent none stages { stage('S') { \
                      steps { echo 'after' } failFast false \
                      parallel { stage('P') { steps { echo 'p' } } } } } }";

        let pipeline = parse_pipeline(source).unwrap();
        let stage = &pipeline.stages[0];
        assert_eq!(stage.fail_fast, Some(false));
        assert_eq!(stage.steps.len(), 1);
        assert_eq!(stage.parallel.len(), 1);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let source = r#"
            pipeline {
                agent none
                stages {
                    stage('One') { steps { sh "make" git url: 'u', branch: 'b' } }
                    stage('Two') { parallel { stage('A') { steps { echo 'a' } } } }
                }
            }
        "#;

        assert_eq!(parse_pipeline(source).unwrap(), parse_pipeline(source).unwrap());
    }

    #[test]
    fn test_quoted_content_is_preserved() {
        let source = r#"pipeline { agent none stages { stage("it's: {odd}, (really)") {
            steps { sh 'echo "a, b: {c}" // not a comment' } } } }"#;

        let pipeline = parse_pipeline(source).unwrap();
        assert_eq!(pipeline.stages[0].name, "it's: {odd}, (really)");
        assert_eq!(
            pipeline.stages[0].steps[0],
            sh(r#"echo "a, b: {c}" // not a comment"#)
        );
    }

    #[test]
    fn test_missing_stages_is_rejected() {
        let err = parse_pipeline("pipeline { agent none }").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { ref found, .. } if found == "'}'"));
        assert_eq!(err.position(), Some((1, 23)));
    }

    #[test]
    fn test_empty_stages_block_is_rejected() {
        let err = parse_pipeline("pipeline { agent none stages { } }").unwrap_err();
        assert!(err.to_string().contains("keyword 'stage'"));
    }

    #[test]
    fn test_unterminated_block_is_rejected() {
        let err =
            parse_pipeline("pipeline { agent none stages { stage('x') { steps { sh 'a' }")
                .unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        let err = parse_pipeline(
            "pipeline { agent none stages { stage('x') { steps { sh 'a' } } } } extra",
        )
        .unwrap_err();
        assert!(err.to_string().contains("end of input"));
    }

    #[test]
    fn test_step_without_arguments_is_rejected() {
        let err = parse_pipeline(
            "pipeline { agent none stages { stage('x') { steps { checkout sh 'a' } } } }",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken { ref found, .. } if found == "identifier 'sh'"
        ));
    }

    #[test]
    fn test_empty_stage_name_is_rejected() {
        let err = parse_pipeline("pipeline { agent none stages { stage('') { } } }").unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
    }

    #[test]
    fn test_lexical_error_surfaces() {
        let err = parse_pipeline("pipeline { agent none; }").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedChar { found: ';', .. }));
    }

    #[test]
    fn test_ast_serializes_to_json() {
        let pipeline =
            parse_pipeline("pipeline { agent none stages { stage('x') { steps { sh 'a' } } } }")
                .unwrap();
        let json = serde_json::to_value(&pipeline).unwrap();
        assert_eq!(json["stages"][0]["steps"][0]["kind"], "SingleKV");
        assert_eq!(json["agent"]["type"], "none");
    }
}
